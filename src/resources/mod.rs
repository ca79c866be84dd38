pub mod common;
pub mod pod;
pub mod pvc;

pub use common::{
    API_VERSION, FIELD_MANAGER, KIND, deployment_selector, member_labels, owner_reference,
    standard_labels,
};
pub use pod::{PodTemplate, member_dns_name, pod_name};
pub use pvc::{build_pvc, parse_quantity, pvc_name};
