use super::Token;

/// Ring members sorted by token. A token is owned by the first member whose
/// token is not smaller than it, wrapping around past the largest one.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> Default for TokenRing<ElemT> {
    fn default() -> Self {
        Self { ring: Vec::new() }
    }
}

impl<ElemT> TokenRing<ElemT> {
    pub fn new(members: impl IntoIterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = members.into_iter().collect();
        ring.sort_by_key(|(token, _)| *token);
        TokenRing { ring }
    }

    fn owner_index(&self, token: Token) -> usize {
        // Err(len) means past the largest token, which wraps to index 0
        // through the modulo in `walk`.
        match self.ring.binary_search_by_key(&token, |(t, _)| *t) {
            Ok(idx) | Err(idx) => idx,
        }
    }

    /// Walks the whole ring once, starting at the owner of `token`.
    pub fn walk(&self, token: Token) -> impl Iterator<Item = &ElemT> {
        let start = self.owner_index(token);
        let len = self.ring.len();
        (0..len).map(move |offset| &self.ring[(start + offset) % len].1)
    }

    pub fn owner(&self, token: Token) -> Option<&ElemT> {
        self.walk(token).next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> TokenRing<&'static str> {
        TokenRing::new([
            (Token::new(100), "c"),
            (Token::new(-100), "a"),
            (Token::new(0), "b"),
        ])
    }

    #[test]
    fn owner_is_first_member_at_or_after_token() {
        let ring = ring();
        assert_eq!(ring.owner(Token::new(-150)), Some(&"a"));
        assert_eq!(ring.owner(Token::new(-100)), Some(&"a"));
        assert_eq!(ring.owner(Token::new(-99)), Some(&"b"));
        assert_eq!(ring.owner(Token::new(100)), Some(&"c"));
        // Past the largest token the ring wraps around.
        assert_eq!(ring.owner(Token::new(101)), Some(&"a"));
    }

    #[test]
    fn walk_visits_each_member_once() {
        let ring = ring();
        let walked: Vec<_> = ring.walk(Token::new(50)).copied().collect();
        assert_eq!(walked, vec!["c", "a", "b"]);

        let walked: Vec<_> = ring.walk(Token::new(i64::MAX)).copied().collect();
        assert_eq!(walked, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring: TokenRing<u8> = TokenRing::default();
        assert!(ring.is_empty());
        assert_eq!(ring.owner(Token::new(1)), None);
        assert_eq!(ring.walk(Token::new(1)).count(), 0);
    }
}
