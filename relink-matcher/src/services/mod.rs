//! Service modules for the matching pipeline

pub mod coordinator;
pub mod dispatcher;
pub mod matcher;
pub mod scoring;
pub mod sweeper;
pub mod wikidata_client;
pub mod worker;

pub use coordinator::Coordinator;
pub use dispatcher::JobDispatcher;
pub use matcher::{MatchOutcome, Matcher, MatcherError};
pub use scoring::{score_candidate, Confidence, ScoreBreakdown, ScoreResult};
pub use sweeper::Sweeper;
pub use wikidata_client::{EntitySnapshot, SearchClient, SearchError, WikidataClient};
pub use worker::WorkerPool;
