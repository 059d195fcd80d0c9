//! The two smart-protocol services gitd delegates to the `git` binary.

use std::fmt;

use crate::pkt;

/// A Git smart-protocol service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    /// Parse the wire name used by the `service=` query value and the
    /// daemon handshake. Anything else is unsupported.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// Wire name, e.g. `git-upload-pack`.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Subcommand name for `git <cmd>`, e.g. `upload-pack`.
    pub fn command(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    /// `Content-Type` of the `info/refs` advertisement response.
    pub fn advertisement_content_type(self) -> String {
        format!("application/x-{}-advertisement", self.wire_name())
    }

    /// `Content-Type` of the RPC result response.
    pub fn result_content_type(self) -> String {
        format!("application/x-{}-result", self.wire_name())
    }

    /// The smart-HTTP advertisement prelude: a `# service=` packet-line
    /// followed by a flush. The subprocess output is appended verbatim.
    pub fn advertisement_header(self) -> Vec<u8> {
        let mut out = pkt::pkt_line_str(&format!("# service={}\n", self.wire_name()));
        out.extend_from_slice(pkt::FLUSH);
        out
    }

    /// Arguments for the stateless-RPC subprocess, without the repo path.
    pub fn rpc_args(self, advertise: bool) -> Vec<&'static str> {
        let mut args = vec![self.command(), "--stateless-rpc"];
        if advertise {
            args.push("--advertise-refs");
        }
        args
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_names() {
        assert_eq!(Service::from_wire("git-upload-pack"), Some(Service::UploadPack));
        assert_eq!(Service::from_wire("git-receive-pack"), Some(Service::ReceivePack));
        assert_eq!(Service::from_wire("git-upload-archive"), None);
        assert_eq!(Service::from_wire(""), None);
    }

    #[test]
    fn advertisement_header_is_pkt_framed() {
        let header = Service::UploadPack.advertisement_header();
        assert_eq!(&header[..4], b"001e");
        assert!(header.ends_with(b"0000"));
    }

    #[test]
    fn content_types() {
        assert_eq!(
            Service::ReceivePack.advertisement_content_type(),
            "application/x-git-receive-pack-advertisement"
        );
        assert_eq!(
            Service::UploadPack.result_content_type(),
            "application/x-git-upload-pack-result"
        );
    }

    #[test]
    fn rpc_args_shape() {
        assert_eq!(
            Service::UploadPack.rpc_args(true),
            vec!["upload-pack", "--stateless-rpc", "--advertise-refs"]
        );
        assert_eq!(
            Service::ReceivePack.rpc_args(false),
            vec!["receive-pack", "--stateless-rpc"]
        );
    }
}
