use camino::Utf8PathBuf;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct StoreConfig {
    /// Root directory; every space lives in its own subdirectory.
    pub path: Utf8PathBuf,
}

impl StoreConfig {
    #[must_use]
    pub const fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }
}
