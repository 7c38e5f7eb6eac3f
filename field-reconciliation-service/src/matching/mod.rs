//! Matching of field payments to books payments.

pub mod engine;
pub mod scorer;

pub use engine::{
    MatchDecision, MatchPass, MatchingConfig, MatchingEngine, ScoredCandidate, TakenSet,
};
pub use scorer::{breakdown, score, PaymentFacts, ScoreBreakdown};
