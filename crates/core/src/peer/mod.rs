mod manager;

pub use manager::{Candidate, CandidateManager};
