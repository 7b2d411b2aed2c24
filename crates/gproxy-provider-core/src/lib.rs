pub mod credential;
pub mod errors;
pub mod headers;
pub mod provider;
pub mod registry;
pub mod router;
pub mod selection;
pub mod vision_cache;

pub use credential::{AccountSlot, CredentialStore, OAuthTokenRecord, decode_jwt_claims};
pub use errors::{ProviderError, ProviderResult};
pub use headers::{Headers, header_get, header_set};
pub use provider::{BodyStream, DispatchContext, Provider};
pub use registry::ProviderRegistry;
pub use router::{ProviderTag, ReasoningLevel, Selection, parse_model};
pub use selection::ActiveSelectionCell;
pub use vision_cache::VisionCache;
