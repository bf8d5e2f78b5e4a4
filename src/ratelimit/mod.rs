//! Rate-limit bucket table and adaptive governor

mod endpoints;
mod governor;

pub use endpoints::{
    BucketRule, DEFAULT_BUCKET, EndpointMatch, EndpointResolver, WILDCARD, parse_mapping,
};
pub use governor::{
    BucketState, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER, RateLimitGovernor,
    RateLimitHeaders,
};

pub(crate) use governor::header_number;
