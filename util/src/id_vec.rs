use std::marker::PhantomData;

/// Vec wrapper that uses typed indexes.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct IdVec<K, V> {
    vec: Vec<V>,
    _phantom: PhantomData<K>,
}

// derived Default would demand `K: Default` and `V: Default`.
impl<K, V> Default for IdVec<K, V> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<K, V> IdVec<K, V> {
    /// Create a new `IdVec` backed by the given vec.
    fn new(vec: Vec<V>) -> Self {
        Self {
            vec,
            _phantom: PhantomData,
        }
    }

    /// Create a new `IdVec` with the given capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Self::new(Vec::with_capacity(cap))
    }

    /// Get the current length
    #[inline]
    pub fn len(&self) -> usize {
        self.vec.len()
    }

    /// True if len == 0
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    /// Iterate through immutable references to values
    pub fn iter(&self) -> std::slice::Iter<'_, V> {
        self.vec.iter()
    }

    /// Iterate through mutable references to values
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, V> {
        self.vec.iter_mut()
    }
}

impl<K, V: Clone> IdVec<K, V> {
    /// Create a new `IdVec`, filled with `len` copies of `val`.
    pub fn fill(val: V, len: usize) -> Self {
        Self::new(vec![val; len])
    }
}

impl<K: Into<usize>, V> IdVec<K, V> {
    /// Get the value with id `k`.
    #[inline]
    pub fn get(&self, k: K) -> &V {
        &self.vec[k.into()]
    }

    /// Get a mutable reference to value with id `k`.
    #[inline]
    pub fn get_mut(&mut self, k: K) -> &mut V {
        &mut self.vec[k.into()]
    }

    /// Get the value with id `k`, or `None` if `k` is out of range.
    #[inline]
    pub fn try_get(&self, k: K) -> Option<&V> {
        self.vec.get(k.into())
    }
}

impl<K: From<usize>, V> IdVec<K, V> {
    /// Push `v` into the underlying vec, and return an id that can be used to retrieve it later.
    #[inline]
    pub fn push(&mut self, v: V) -> K {
        let id = self.vec.len().into();
        self.vec.push(v);
        id
    }

    /// Iterate through all ids currently in use, in order.
    pub fn ids(&self) -> impl Iterator<Item = K> {
        (0..self.vec.len()).map(K::from)
    }

    /// Iterate through (id, value) pairs, in order.
    pub fn iter_with_ids(&self) -> impl Iterator<Item = (K, &V)> {
        self.vec.iter().enumerate().map(|(i, v)| (K::from(i), v))
    }
}

#[cfg(test)]
mod test {
    use super::IdVec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Id(usize);
    impl From<usize> for Id {
        fn from(i: usize) -> Self {
            Id(i)
        }
    }
    impl From<Id> for usize {
        fn from(id: Id) -> usize {
            id.0
        }
    }

    #[test]
    fn test_push_and_get() {
        let mut v: IdVec<Id, &str> = IdVec::with_capacity(2);
        let a = v.push("a");
        let b = v.push("b");
        assert_eq!(Id(0), a);
        assert_eq!(Id(1), b);
        assert_eq!(&"b", v.get(b));
        assert_eq!(None, v.try_get(Id(2)));
    }

    // neither `Id` nor `Opaque` implement Default.
    struct Opaque;

    #[test]
    fn test_default_without_default_params() {
        let mut v: IdVec<Id, Opaque> = IdVec::default();
        assert!(v.is_empty());
        assert_eq!(Id(0), v.push(Opaque));
    }

    #[test]
    fn test_iter_with_ids() {
        let mut v: IdVec<Id, u8> = IdVec::with_capacity(3);
        v.push(10);
        v.push(20);
        let pairs: Vec<_> = v.iter_with_ids().map(|(k, x)| (k.0, *x)).collect();
        assert_eq!(vec![(0, 10), (1, 20)], pairs);
        assert_eq!(vec![Id(0), Id(1)], v.ids().collect::<Vec<_>>());
    }
}
