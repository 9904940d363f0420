//! Core provider abstractions for relay.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP client.
//! Provider implementations should construct `UpstreamHttpRequest` (and optional
//! internal requests like `upstream_usage`), while a higher layer performs IO.

pub mod billing;
pub mod candidate;
pub mod config;
pub mod credential;
pub mod disallow;
pub mod errors;
pub mod events;
pub mod headers;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod traffic;

pub use billing::{
    BillingBreakdown, BillingError, BillingSnapshot, ResolvedVariables, UsageDimensions,
    compute_billing,
};
pub use config::{
    ClaudeCodePreludeText, CountTokensMode, DispatchRule, DispatchTable, ModelTable, OperationKind,
    ProviderConfig,
};
pub use credential::{
    AcquireError, Credential, CredentialId, CredentialPool, CredentialState, UnavailableReason,
};
pub use errors::{ProviderError, ProviderResult};
pub use events::{
    DownstreamEvent, Event, EventHub, EventSink, ModelUnavailableEndEvent,
    ModelUnavailableStartEvent, OperationalEvent, TerminalEventSink, UnavailableEndEvent,
    UnavailableStartEvent, UpstreamEvent,
};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use provider::{
    AuthRetryAction, HttpMethod, OAuthCallbackRequest, OAuthCallbackResult, OAuthCredential,
    OAuthStartRequest, UpstreamBody, UpstreamCtx, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamProvider,
};
pub use registry::ProviderRegistry;
pub use pool::{CandidateHealth, PoolManager, ReorderResult};
pub use candidate::{Candidate, CandidateBuilder, SkippedCandidate};
pub use scheduler::Scheduler;
pub use traffic::{
    DownstreamRecordMeta, DownstreamTrafficEvent, NoopTrafficSink, SharedTrafficSink, TrafficSink,
    TrafficUsage, UpstreamRecordMeta, UpstreamTrafficEvent, build_downstream_event,
    build_upstream_event, record_upstream, usage_dimensions,
};

// Re-export the protocol/transform typed enums from relay-transform.
pub use relay_transform::middleware::{
    CountTokensRequest, CountTokensResponse, GenerateContentRequest, GenerateContentResponse,
    MemoryTraceSummarizeRequest, MemoryTraceSummarizeResponse, ModelGetRequest, ModelGetResponse,
    ModelListRequest, ModelListResponse, Op, Proto, Request, Response, ResponseCancelRequest,
    ResponseCancelResponse, ResponseCompactRequest, ResponseCompactResponse, ResponseDeleteRequest,
    ResponseDeleteResponse, ResponseGetRequest, ResponseGetResponse, ResponseListInputItemsRequest,
    ResponseListInputItemsResponse, StreamEvent, StreamFormat, TransformContext, TransformError,
    stream_format,
};

// Re-export usage helpers used by the middleware/engine layer.
pub use relay_transform::middleware::{
    CountTokensFn, OutputAccumulator, UsageAccumulator, UsageError, UsageSummary,
    fallback_usage_with_count_tokens, output_for_counting, usage_from_response,
};
