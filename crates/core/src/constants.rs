//! Protocol constants for the inference chain.
//!
//! Values mirror on-chain parameters and the conventions of the chain's
//! public query API. Changing any of them changes what the cache considers
//! canonical.

/// Maximum number of inference records retained per (epoch, participant, category).
pub const INFERENCE_TOP_N: usize = 10;

/// Offset subtracted from the next epoch's effective height to obtain an
/// epoch's canonical settlement height.
pub const SETTLEMENT_HEIGHT_OFFSET: u64 = 10;

/// Micro-denomination units per GNK.
pub const UGNK_PER_GNK: u128 = 1_000_000_000;

/// Distance in blocks between the current block and the timeline reference block.
pub const TIMELINE_REFERENCE_DISTANCE: u64 = 10_000;

/// Bech32 prefix of validator operator addresses.
pub const VALOPER_PREFIX: &str = "gonkavaloper";

/// Bech32 prefix of validator consensus addresses.
pub const VALCONS_PREFIX: &str = "gonkavalcons";

/// Sentinel prefix the slashing module reports for "never jailed".
pub const UNSET_JAILED_UNTIL_PREFIX: &str = "1970-01-01";

/// Message types a grantee must be authorized for to count as a warm key.
pub const WARM_KEY_REQUIRED_PERMISSIONS: [&str; 24] = [
    "MsgStartInference",
    "MsgFinishInference",
    "MsgClaimRewards",
    "MsgValidation",
    "MsgSubmitPocBatch",
    "MsgSubmitPocValidation",
    "MsgSubmitSeed",
    "MsgBridgeExchange",
    "MsgSubmitTrainingKvRecord",
    "MsgJoinTraining",
    "MsgJoinTrainingStatus",
    "MsgTrainingHeartbeat",
    "MsgSetBarrier",
    "MsgClaimTrainingTaskForAssignment",
    "MsgAssignTrainingTask",
    "MsgSubmitNewUnfundedParticipant",
    "MsgSubmitHardwareDiff",
    "MsgInvalidateInference",
    "MsgRevalidateInference",
    "MsgSubmitDealerPart",
    "MsgSubmitVerificationVector",
    "MsgRequestThresholdSignature",
    "MsgSubmitPartialSignature",
    "MsgSubmitGroupKeyValidationSignature",
];
