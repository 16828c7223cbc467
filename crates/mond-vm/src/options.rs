//! Global option knobs of the engine.

/// When this option is false, the interpreter won't tier up to the
/// baseline JIT, so the VM runs in interpreter-only mode regardless of
/// runtime policy.
pub const ALLOW_INTERPRETER_TIER_UP_TO_BASELINE_JIT: bool = true;

/// The interpreter maintains how many bytes of bytecode each function
/// has executed to decide when to tier up. (The metric is bytes, not
/// instruction count, because it is the cheaper one to maintain.)
///
/// After more than `multiplier * bytecode_len` bytes have been retired,
/// the function tiers up to the baseline JIT.
///
/// The multiplier approximates the rent-to-buy ratio: generating
/// baseline code for one bytecode costs roughly 20x interpreting it
/// once, and we pay the one-time generation cost as soon as the
/// interpretation cost already spent matches it.
pub const INTERPRETER_TIER_UP_THRESHOLD_BYTECODE_LENGTH_MULTIPLIER: u64 = 20;

/// Runtime tier selection, overridable per VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TierPolicy {
    /// Interpret, tiering up past the threshold.
    #[default]
    Default,
    /// Never tier up.
    ForceInterpreter,
    /// Generate baseline code on first entry.
    ForceBaseline,
}

/// Per-VM configuration.
#[derive(Clone, Copy, Debug)]
pub struct VmOptions {
    pub tier_policy: TierPolicy,
    pub tier_up_multiplier: u64,
    /// Maximum interpreter call-frame depth before StackOverflow.
    pub max_call_depth: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            tier_policy: TierPolicy::Default,
            tier_up_multiplier: INTERPRETER_TIER_UP_THRESHOLD_BYTECODE_LENGTH_MULTIPLIER,
            max_call_depth: 200,
        }
    }
}
