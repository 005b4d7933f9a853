//! Rate-limited HTTP command channel.
//!
//! Every REST call resolves to one or more [`bucket::Bucket`]s and is admitted
//! jointly before the HTTP request fires. The buckets gate concurrency only;
//! HTTP outcomes, including 429s, are surfaced to the caller.

pub mod bucket;
pub mod dispatcher;

pub use bucket::{AdmitGate, Bucket};
pub use dispatcher::{
    BucketKey, FileAttachment, Method, RequestDispatcher, RequestDispatcherOptions,
    RequestOptions, RestError,
};
