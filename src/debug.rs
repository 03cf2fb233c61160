//! Debug logging utilities for vmexec.
//!
//! Set the `VMEXEC_DEBUG` environment variable to enable verbose logging:
//! - `VMEXEC_DEBUG=1` - Enable all debug output
//! - `VMEXEC_DEBUG=vcpu` - Enable only vCPU dispatch logs
//! - `VMEXEC_DEBUG=memory` - Enable only guest memory logs
//! - `VMEXEC_DEBUG=vcpu,memory` - Enable multiple categories
//!
//! Call [`init`] once to install a subscriber that honors it. Without the
//! variable only warnings and errors are printed.

use std::sync::OnceLock;

use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Vcpu,
    Memory,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default, PartialEq, Eq)]
struct DebugConfig {
    enabled: bool,
    vcpu: bool,
    memory: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        Self::parse(std::env::var("VMEXEC_DEBUG").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(val) if val == "1" || val.eq_ignore_ascii_case("all") => Self {
                enabled: true,
                vcpu: true,
                memory: true,
            },
            Some(val) => {
                let val_lower = val.to_lowercase();
                Self {
                    enabled: true,
                    vcpu: val_lower.split(',').any(|c| c.trim() == "vcpu"),
                    memory: val_lower.split(',').any(|c| c.trim() == "memory"),
                }
            }
            None => Self::default(),
        }
    }

    fn targets(&self) -> Targets {
        let mut targets = Targets::new().with_default(LevelFilter::WARN);
        if self.vcpu {
            targets = targets
                .with_target("vmexec::vcpu", LevelFilter::TRACE)
                .with_target("vmexec::backend", LevelFilter::TRACE);
        }
        if self.memory {
            targets = targets.with_target("vmexec::memory", LevelFilter::TRACE);
        }
        targets
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    let config = get_config();
    if !config.enabled {
        return false;
    }
    match category {
        DebugCategory::All => config.vcpu || config.memory,
        DebugCategory::Vcpu => config.vcpu,
        DebugCategory::Memory => config.memory,
    }
}

/// Install a stderr subscriber filtered by `VMEXEC_DEBUG`.
///
/// Does nothing if a global subscriber is already set.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_max_level(LevelFilter::TRACE)
        .finish()
        .with(get_config().targets())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_categories() {
        assert_eq!(DebugConfig::parse(None), DebugConfig::default());

        let all = DebugConfig::parse(Some("ALL"));
        assert!(all.vcpu && all.memory);

        let memory = DebugConfig::parse(Some("memory"));
        assert!(memory.enabled);
        assert!(memory.memory);
        assert!(!memory.vcpu);

        let both = DebugConfig::parse(Some("vcpu, memory"));
        assert!(both.vcpu && both.memory);
    }

    #[test]
    fn test_targets_follow_categories() {
        use tracing::Level;

        let quiet = DebugConfig::default().targets();
        assert!(!quiet.would_enable("vmexec::vcpu", &Level::DEBUG));
        assert!(quiet.would_enable("vmexec::vcpu", &Level::WARN));

        let vcpu = DebugConfig::parse(Some("vcpu")).targets();
        assert!(vcpu.would_enable("vmexec::vcpu::registry", &Level::TRACE));
        assert!(!vcpu.would_enable("vmexec::memory::gmm", &Level::DEBUG));
    }

    #[test]
    fn test_init_twice() {
        init();
        init();
    }
}
