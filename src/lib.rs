#![doc(html_root_url = "https://docs.rs/asyncdns/0.1")]

//! *asyncdns* - A parallel DNS query engine over a single UDP socket.
//!
//! A [`Pipeline`] fans one question out to many name servers in parallel,
//! multiplexes their responses on one UDP socket, and enforces
//! per-(request, nameserver) timeouts through a hashed [`TimeWheel`].
//! Datagrams can transparently be tunneled through a SOCKS5 proxy via
//! [`socks`].
//!
//! [`Pipeline`]: struct.Pipeline.html
//! [`TimeWheel`]: wheel/struct.TimeWheel.html
//! [`socks`]: socks/index.html

pub use failure;

mod endpoint;
mod error;
mod pipeline;
mod resolver;
pub mod socks;
mod utils;
pub mod wheel;

pub use endpoint::{Host, HostParseError, ProxyAddr};
pub use error::{Error, ErrorKind};
pub use pipeline::{
    system_nameservers, Answer, Callback, Pipeline, Query, DEFAULT_PORT,
    DEFAULT_TIMEOUT,
};
pub use resolver::{LookupCallback, LookupResults, RecordValue, Resolver};
pub use utils::{CollectedResults, CountDownLatch, ResultCollector};
pub use wheel::{Expiration, TimeSlot, TimeWheel, Timer};

/// Configurations for *asyncdns* types.
pub mod config {
    pub use crate::pipeline::PipelineConfig;
    pub use crate::wheel::WheelConfig;
}

/// The DNS library types that appear in this crate's API.
pub mod dns {
    pub use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
    pub use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
}

#[cfg(test)]
mod test {
    #[test]
    fn test_readme_deps() {
        version_sync::assert_markdown_deps_updated!("README.md");
    }

    #[test]
    fn test_html_root_url() {
        version_sync::assert_html_root_url_updated!("src/lib.rs");
    }
}
