//! `Meridian` Core: RPC wire envelopes, dynamic argument values and cache-key templates.

pub mod cache_key;
pub mod clock;
pub mod messages;
pub mod types;

pub use cache_key::{render_cache_key, template_tokens, tokens_of, CacheKeyFragment};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use messages::{
    attachment_keys, Attachments, ErrorEnvelope, RemoteInvokeMessage, RemoteResultMessage,
    ResultStatus, TransportContent, TransportMessage, ValidationError,
};
pub use types::Value;

