use errors::ErrorMetadata;

/// Bounded thresholds applied by the scanner (C3) and consulted by the
/// worker pool (for its thread count). A value of `0` means "unbounded" for
/// every field except `worker_pool_size`, whose `0` means "use
/// `effective_worker_pool_size()`'s host-parallelism default".
#[derive(Clone, Debug)]
pub struct ExtractionLimits {
    pub max_input_size: u64,
    pub max_entry_size: u64,
    pub max_total_size: u64,
    pub max_entries: u64,
    pub max_path_length: u64,
    pub worker_pool_size: usize,
    pub include_glob: Option<String>,
    pub allow_list: Option<Vec<String>>,
    pub html_tail: Option<String>,
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            max_input_size: 0,
            max_entry_size: 0,
            max_total_size: 0,
            max_entries: 0,
            max_path_length: 0,
            worker_pool_size: 0,
            include_glob: None,
            allow_list: None,
            html_tail: None,
        }
    }
}

impl ExtractionLimits {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.include_glob.is_some() && self.allow_list.is_some() {
            anyhow::bail!(ErrorMetadata::invalid_params(
                "InvalidParams",
                "filter and only_files[] are mutually exclusive",
            ));
        }
        Ok(())
    }

    /// Worker count to hand to the worker pool: the configured value, or the
    /// host's parallelism (floored at 1) when unset.
    pub fn effective_worker_pool_size(&self) -> usize {
        if self.worker_pool_size != 0 {
            return self.worker_pool_size;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_worker_pool_size_falls_back_to_host_parallelism() {
        let limits = ExtractionLimits::default();
        assert!(limits.effective_worker_pool_size() >= 1);
    }

    #[test]
    fn configured_worker_pool_size_is_honored() {
        let limits = ExtractionLimits {
            worker_pool_size: 4,
            ..Default::default()
        };
        assert_eq!(limits.effective_worker_pool_size(), 4);
    }

    #[test]
    fn glob_and_allow_list_reject_together() {
        let limits = ExtractionLimits {
            include_glob: Some("*".into()),
            allow_list: Some(vec!["a".into()]),
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }
}
