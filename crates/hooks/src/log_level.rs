//! Substitutes the operand verbosity into container arguments.

use filestore_apply::Workload;
use filestore_core::{OperatorConfig, LOG_LEVEL_PLACEHOLDER};

use crate::{Hook, HookError};

pub struct LogLevelHook;

impl Hook for LogLevelHook {
    fn name(&self) -> &'static str { "log-level" }

    fn apply(&self, config: &OperatorConfig, workload: &mut Workload) -> Result<(), HookError> {
        let verbosity = config.log_level.verbosity().to_string();
        for c in workload.containers_mut() {
            for arg in c.args.iter_mut().flatten() {
                if arg.contains(LOG_LEVEL_PLACEHOLDER) {
                    *arg = arg.replace(LOG_LEVEL_PLACEHOLDER, &verbosity);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use filestore_core::LogLevel;

    #[test]
    fn placeholder_follows_log_level() {
        let mut cfg = OperatorConfig::new("ns");
        cfg.log_level = LogLevel::Trace;
        let mut w = deployment(vec![container("csi-driver", &["--endpoint=unix:/csi/csi.sock", "--v=${LOG_LEVEL}"])]);
        LogLevelHook.apply(&cfg, &mut w).unwrap();
        assert_eq!(w.containers()[0].args.as_deref().unwrap(), &["--endpoint=unix:/csi/csi.sock", "--v=6"]);
    }
}
