//! API request handlers

pub mod admission;
pub mod attesters;
pub mod enforcers;
pub mod namespaces;
pub mod occurrences;

pub use admission::{enforce, validate, EnforceRequest, EnforceResponse};
pub use attesters::{
    delete_attester, get_attester, list_attesters, register_attester, AttesterInfo,
    ListAttestersResponse, RegisterAttesterRequest, RegisterAttesterResponse,
};
pub use enforcers::{apply_enforcer, delete_enforcer, list_enforcers, EnforcerInfo, ListEnforcersResponse};
pub use namespaces::{set_namespace_labels, NamespaceLabelsResponse, SetLabelsRequest};
pub use occurrences::{
    create_occurrences, list_occurrences, AppState, CreateOccurrencesRequest, OccurrencesResponse,
};
