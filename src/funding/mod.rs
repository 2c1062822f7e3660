//! Funding-rate analytics and the aggregation-service client.

pub mod analyzer;
pub mod service;

pub use analyzer::{FundingAnalyzer, PairQuote, SECONDS_PER_YEAR};
pub use service::{FundingServiceClient, FundingSource, RateComparison, StaticFundingSource};
