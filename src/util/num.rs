/// Round up `n` to the nearest `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// How many `to`-sized units it takes to cover `n`
pub fn units_for(n: usize, to: usize) -> usize {
    n.div_ceil(to)
}

/// Write `n` as decimal digits into `buf`, returning the digits. `buf` is big
/// enough for any `usize`.
pub fn format_decimal(mut n: usize, buf: &mut [u8; 20]) -> &[u8] {
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[i..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_up_rounds_to_multiples() {
        assert_eq!(round_up(0, 128), 0);
        assert_eq!(round_up(1, 128), 128);
        assert_eq!(round_up(128, 128), 128);
        assert_eq!(round_up(129, 128), 256);
        assert_eq!(units_for(40, 128), 1);
        assert_eq!(units_for(4097, 4096), 2);
    }

    #[test]
    pub fn format_decimal_writes_digits() {
        let mut buf = [0; 20];
        assert_eq!(format_decimal(0, &mut buf), b"0");
        assert_eq!(format_decimal(1234567, &mut buf), b"1234567");
        assert_eq!(
            format_decimal(usize::MAX, &mut buf),
            usize::MAX.to_string().as_bytes()
        );
    }
}
