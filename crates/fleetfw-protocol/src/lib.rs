pub mod client;
pub mod http;
pub mod hypervisor;
pub mod inventory;
pub mod ipmi;
pub mod manager;
pub mod poller;
mod process;
pub mod racadm;
pub mod redfish;
pub mod ssh;
pub mod wsman;

pub use client::ProtocolClient;
pub use http::{endpoint_host, normalize_base_url, HttpSettings};
pub use hypervisor::{HypervisorClient, MaintenanceOptions};
pub use inventory::{collect_software_inventory, diff_inventories};
pub use ipmi::IpmiClient;
pub use manager::{Candidate, Detection, ProtocolManager, RetryPolicy, UpdateOutcome};
pub use poller::{poll_task, PollOptions};
pub use racadm::RacadmClient;
pub use redfish::{RedfishClient, UpdateActions};
pub use ssh::SshClient;
pub use wsman::WsmanClient;
