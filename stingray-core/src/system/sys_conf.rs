use std::thread;

/// System-level configuration queries.
///
pub struct SysConf;

impl SysConf {
    /// Number of hardware execution units available to this process.
    /// Scheduler pools are sized against this bound.
    ///
    pub fn num_cores() -> usize {
        thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::SysConf;

    #[test]
    fn reports_at_least_one_core() {
        assert!(SysConf::num_cores() >= 1);
    }
}
