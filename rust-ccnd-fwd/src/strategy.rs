//! Forwarding strategies.
//!
//! A strategy instance is attached to a name-prefix node and inherited by
//! everything below it; the engine calls out at the decision points of the
//! per-interest state machine. Strategies are a closed set; no dynamic
//! loading.

use rust_ccnd_common::Error;

/// Number of per-node strategy state slots.
pub const STRATEGY_STATE_N: usize = 4;

/// Unset value for a strategy state slot.
pub const STATE_UNINIT: u32 = u32::MAX;

/// Decision points presented to a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyOp {
    /// Instance attached to a prefix.
    Init,
    /// First arrival of an Interest with no existing PIT entry.
    First,
    /// A further downstream arrival refreshed an existing entry.
    Refresh,
    /// The entry is going away with no pending items left.
    Timeout,
    /// Content satisfied the entry; faceid is the arrival face.
    Satisfied,
    /// An upstream's outstanding request expired.
    ExpUp,
    /// A downstream expired and was removed.
    ExpDn,
    /// Upstreams marked ATTENTION need a transmit decision.
    Update,
    /// Instance being detached; must release its state.
    Finalize,
}

/// Per-node strategy scratch space, inherited by child nodes at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyState {
    pub s: [u32; STRATEGY_STATE_N],
}

impl Default for StrategyState {
    fn default() -> Self {
        Self {
            s: [STATE_UNINIT; STRATEGY_STATE_N],
        }
    }
}

/// The closed set of strategy classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyClass {
    /// Forward to every eligible upstream.
    #[default]
    Default,
}

impl StrategyClass {
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "default" => Some(StrategyClass::Default),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            StrategyClass::Default => "default",
        }
    }
}

/// A strategy class bound to a prefix with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyInstance {
    pub class: StrategyClass,
    pub parameters: String,
}

impl StrategyInstance {
    /// Builds an instance, carrying a diagnostic back on an unknown id or
    /// parameters the class cannot accept.
    pub fn create(id: &str, parameters: Option<&str>) -> Result<Self, Error> {
        let class = StrategyClass::from_id(id).ok_or_else(|| Error::Admin {
            code: 504,
            reason: format!("unknown strategy {id}"),
        })?;
        let parameters = parameters.unwrap_or("").to_string();
        match class {
            StrategyClass::Default => {
                if !parameters.is_empty() {
                    return Err(Error::Admin {
                        code: 504,
                        reason: "default strategy takes no parameters".into(),
                    });
                }
            }
        }
        Ok(Self { class, parameters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_class_roundtrip() {
        let si = StrategyInstance::create("default", None).unwrap();
        assert_eq!(si.class.id(), "default");
        assert!(StrategyInstance::create("mystery", None).is_err());
        assert!(StrategyInstance::create("default", Some("x=1")).is_err());
    }
}
