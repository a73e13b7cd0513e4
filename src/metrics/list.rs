use allocator_api2::{
    alloc::{Allocator, Global},
    vec::Vec,
};

const NIL: usize = usize::MAX;

struct Node<T> {
    item: Option<T>,
    prev: usize,
    next: usize,
}

/// A doubly linked list whose nodes live in one vector, linked by index.
/// Freed nodes are chained through `next` and reused.
pub struct MetricsList<T, A: Allocator = Global> {
    nodes: Vec<Node<T>, A>,
    head: usize,
    tail: usize,
    vacant: usize,
    len: usize,
}

impl<T> MetricsList<T, Global> {
    pub fn new() -> Self {
        Self::new_in(Global)
    }
}

impl<T> Default for MetricsList<T, Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: Allocator> MetricsList<T, A> {
    pub fn new_in(alloc: A) -> Self {
        Self {
            nodes: Vec::new_in(alloc),
            head: NIL,
            tail: NIL,
            vacant: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `item` at the back
    pub fn push(&mut self, item: T) {
        let node = Node {
            item: Some(item),
            prev: self.tail,
            next: NIL,
        };
        let index = if self.vacant != NIL {
            let index = self.vacant;
            self.vacant = self.nodes[index].next;
            self.nodes[index] = node;
            index
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };
        match self.tail {
            NIL => self.head = index,
            tail => self.nodes[tail].next = index,
        }
        self.tail = index;
        self.len += 1;
    }

    fn unlink(&mut self, index: usize) -> Option<T> {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        match prev {
            NIL => self.head = next,
            prev => self.nodes[prev].next = next,
        }
        match next {
            NIL => self.tail = prev,
            next => self.nodes[next].prev = prev,
        }
        let node = &mut self.nodes[index];
        node.next = self.vacant;
        node.prev = NIL;
        self.vacant = index;
        self.len -= 1;
        node.item.take()
    }

    /// Remove the first item equal to `item`
    pub fn remove(&mut self, item: &T) -> Option<T>
    where
        T: PartialEq,
    {
        let mut index = self.head;
        while index != NIL {
            if self.nodes[index].item.as_ref() == Some(item) {
                return self.unlink(index);
            }
            index = self.nodes[index].next;
        }
        None
    }

    pub fn last(&self) -> Option<&T> {
        match self.tail {
            NIL => None,
            tail => self.nodes[tail].item.as_ref(),
        }
    }

    pub fn last_mut(&mut self) -> Option<&mut T> {
        match self.tail {
            NIL => None,
            tail => self.nodes[tail].item.as_mut(),
        }
    }

    /// Remove and return the last item
    pub fn pop(&mut self) -> Option<T> {
        match self.tail {
            NIL => None,
            tail => self.unlink(tail),
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = NIL;
        self.tail = NIL;
        self.vacant = NIL;
        self.len = 0;
    }

    /// Front to back
    pub fn iter(&self) -> Iter<'_, T, A> {
        Iter {
            list: self,
            next: self.head,
        }
    }

    /// Front to back, mutably
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut T)) {
        let mut index = self.head;
        while index != NIL {
            let node = &mut self.nodes[index];
            if let Some(item) = node.item.as_mut() {
                f(item);
            }
            index = node.next;
        }
    }
}

pub struct Iter<'a, T, A: Allocator> {
    list: &'a MetricsList<T, A>,
    next: usize,
}

impl<'a, T, A: Allocator> Iterator for Iter<'a, T, A> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        while self.next != NIL {
            let node = &self.list.nodes[self.next];
            self.next = node.next;
            if let Some(item) = node.item.as_ref() {
                return Some(item);
            }
        }
        None
    }
}

impl<'a, T, A: Allocator> IntoIterator for &'a MetricsList<T, A> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T, A>;

    fn into_iter(self) -> Iter<'a, T, A> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(list: &MetricsList<i32>) -> std::vec::Vec<i32> {
        list.iter().copied().collect()
    }

    #[test]
    fn push_pop_like_a_stack() {
        let mut list = MetricsList::new();
        list.push(1);
        list.push(2);
        list.push(3);
        assert_eq!(list.last(), Some(&3));
        assert_eq!(list.pop(), Some(3));
        assert_eq!(list.pop(), Some(2));
        assert_eq!(items(&list), [1]);
        assert_eq!(list.pop(), Some(1));
        assert_eq!(list.pop(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_from_the_middle_keeps_order() {
        let mut list = MetricsList::new();
        for i in 0..5 {
            list.push(i);
        }
        assert_eq!(list.remove(&2), Some(2));
        assert_eq!(list.remove(&0), Some(0));
        assert_eq!(list.remove(&9), None);
        assert_eq!(items(&list), [1, 3, 4]);
        assert_eq!(list.len(), 3);

        // freed nodes get reused, order still follows pushes
        list.push(5);
        list.push(6);
        assert_eq!(items(&list), [1, 3, 4, 5, 6]);
        assert_eq!(list.nodes.len(), 5);
    }

    #[test]
    fn for_each_mut_visits_in_order() {
        let mut list = MetricsList::new();
        list.push(1);
        list.push(2);
        list.for_each_mut(|n| *n *= 10);
        assert_eq!(items(&list), [10, 20]);
        list.clear();
        assert_eq!(list.last(), None);
    }
}
