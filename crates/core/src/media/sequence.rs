/// Outgoing RTP sequence numbers: 16-bit, incremented once per packet,
/// wrapping from 65535 to 0.
///
/// Per RFC 3550 §5.1 the initial value should be random; see
/// [`with_random_start`](Self::with_random_start).
#[derive(Debug, Clone)]
pub struct SequenceGenerator {
    next: u16,
}

impl SequenceGenerator {
    /// Start counting at `initial`; the first [`next`](Self::next) returns it.
    pub fn new(initial: u16) -> Self {
        Self { next: initial }
    }

    pub fn with_random_start() -> Self {
        Self::new(rand::random::<u16>())
    }

    /// Return the current number and advance.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u16 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    /// The number the following call to [`next`](Self::next) will return.
    pub fn peek(&self) -> u16 {
        self.next
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}
