/// Configuration for cluster clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Specifies whether recovery contacts all backups at once.
    /// If set to `false`, backups are queried one after the other in code position order, which
    /// makes call traces deterministic at the cost of latency.
    /// Default is `true`.
    pub concurrent_fetch: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrent_fetch: true,
        }
    }
}

impl Config {
    /// Creates a new `Config` with the given fetch mode.
    ///
    /// # Arguments
    ///
    /// * `concurrent_fetch` - Whether recovery queries the backups concurrently.
    ///
    /// # Returns
    ///
    /// A new `Config`.
    pub fn new(concurrent_fetch: bool) -> Self {
        Self { concurrent_fetch }
    }
}
