//! Candidate codes and their lifecycle states

mod code;
mod state;

pub use code::{
    normalize_code, same_code, CandidateCode, CandidateId, CanonicalCode, CodeOrigin, Fragment,
    NewCandidate,
};
pub use state::{CandidateState, InvalidTransition, Transition, UnknownLabel};
