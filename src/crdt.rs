/// State that replicas can merge without coordination.
///
/// Quorum coordinators depend on this trait to fold replica replies into a
/// single answer: because the merge forms a join-semilattice, the result does
/// not depend on the order in which replies arrive, nor on duplicates.
///
/// # Properties
///
/// All implementations must satisfy:
/// - **Commutativity:** `a.merge(b) == b.merge(a)`
/// - **Associativity:** `a.merge(b.merge(c)) == a.merge(b).merge(c)`
/// - **Idempotency:** `a.merge(a) == a`
pub trait Crdt {
    /// Merge another replica's state into this one.
    ///
    /// After merging, `self` contains the least upper bound of both states.
    fn merge(&mut self, other: &Self);

    /// Return the least upper bound of `self` and `other` without mutating
    /// either side.
    #[must_use]
    fn merged(&self, other: &Self) -> Self
    where
        Self: Clone,
    {
        let mut out = self.clone();
        out.merge(other);
        out
    }
}
