/// ID of an operator in a [`Graph`](crate::Graph).
///
/// IDs are assigned in declaration order, starting from zero, and are the
/// order in which propagation visits operators.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OpId(u32);

impl OpId {
    /// Return the underlying ID value as a usize, for slice indexing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Construct an operator ID from an index into the graph's operator list.
    ///
    /// Panics if the value exceeds `u32::MAX`.
    pub fn from_usize(value: usize) -> OpId {
        OpId(u32::try_from(value).expect("operator index should fit in u32"))
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpId({})", self.0)
    }
}
