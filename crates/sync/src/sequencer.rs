use eyre::bail;

/// Sequence ids of the `Message` frames on one stream.
#[derive(Debug, Default)]
pub(crate) struct Sequencer {
    current: u64,
}

impl Sequencer {
    /// Get next sequence ID and advance counter.
    pub(crate) fn next(&mut self) -> u64 {
        let id = self.current;
        self.current += 1;
        id
    }

    /// Validate and advance to the expected sequence ID.
    ///
    /// A mismatch means frames were dropped, duplicated or reordered.
    pub(crate) fn expect(&mut self, expected: u64) -> eyre::Result<()> {
        if self.current != expected {
            bail!("sequence error: expected {}, at {}", expected, self.current);
        }

        self.current += 1;
        Ok(())
    }
}
