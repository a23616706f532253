//! Git smart-HTTP wire protocol
//!
//! - `pkt_line`: length-prefixed framing and side-band channels
//! - `pack`: pack decoding (with deltas) and undeltified pack encoding
//! - `advertisement`: ref advertisements, smart and dumb
//! - `upload_pack`: fetch negotiation and pack generation
//! - `receive_pack`: push commands, pack application and ref updates

pub mod advertisement;
pub mod error;
pub mod pack;
pub mod pkt_line;
pub mod receive_pack;
pub mod upload_pack;

pub const AGENT: &str = concat!("agent=vellum/", env!("CARGO_PKG_VERSION"));

/// Services a client can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    /// Whether the service writes to the repository.
    pub fn is_push(&self) -> bool {
        matches!(self, Service::ReceivePack)
    }

    pub fn advertisement_content_type(&self) -> String {
        format!("application/x-{}-advertisement", self.name())
    }

    pub fn request_content_type(&self) -> String {
        format!("application/x-{}-request", self.name())
    }

    pub fn result_content_type(&self) -> String {
        format!("application/x-{}-result", self.name())
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
