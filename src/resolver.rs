//! Lookup helpers that project raw answers into per-type value lists.

use crate::{
    error::Error,
    pipeline::{Pipeline, PipelineConfig, Query},
};

use hashbrown::HashMap;
use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RData, Record, RecordType};

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

/// One projected rdata value.
///
/// Obsolete or exotic record types without a dedicated projection are
/// carried through as [`Other`].
///
/// [`Other`]: #variant.Other
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    /// `A` and `AAAA` addresses.
    Address(IpAddr),
    /// An `MX` exchange and its preference.
    MailExchange { preference: u16, exchange: Name },
    /// The name target of `NS`, `CNAME` and `PTR` records.
    Target(Name),
    /// The `SOA` tuple.
    StartOfAuthority {
        mname: Name,
        rname: Name,
        serial: u32,
        refresh: i32,
        retry: i32,
        expire: i32,
        minimum: u32,
    },
    /// An `SRV` service location.
    Service {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    /// The `HINFO` pair.
    HostInfo { cpu: String, os: String },
    /// `TXT` character-strings, decoded lossily as UTF-8.
    Text(Vec<String>),
    /// Any rdata without a dedicated projection.
    Other(RData),
}

/// The projection of one response: every answer value, grouped by record
/// type.
pub type LookupResults = HashMap<RecordType, Vec<RecordValue>>;

/// A lookup callback: the nameserver, the queried name, and the projected
/// results or the error that terminated the request.
pub type LookupCallback = Arc<
    dyn Fn(SocketAddr, Name, Result<LookupResults, Error>)
        + Send
        + Sync
        + 'static,
>;

fn project(record: &Record) -> Option<RecordValue> {
    let data = record.data()?;

    let value = match data {
        RData::A(a) => RecordValue::Address(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => RecordValue::Address(IpAddr::V6(aaaa.0)),
        RData::MX(mx) => RecordValue::MailExchange {
            preference: mx.preference(),
            exchange: mx.exchange().clone(),
        },
        RData::NS(ns) => RecordValue::Target(ns.0.clone()),
        RData::CNAME(cname) => RecordValue::Target(cname.0.clone()),
        RData::PTR(ptr) => RecordValue::Target(ptr.0.clone()),
        RData::SOA(soa) => RecordValue::StartOfAuthority {
            mname: soa.mname().clone(),
            rname: soa.rname().clone(),
            serial: soa.serial(),
            refresh: soa.refresh(),
            retry: soa.retry(),
            expire: soa.expire(),
            minimum: soa.minimum(),
        },
        RData::SRV(srv) => RecordValue::Service {
            priority: srv.priority(),
            weight: srv.weight(),
            port: srv.port(),
            target: srv.target().clone(),
        },
        RData::HINFO(hinfo) => RecordValue::HostInfo {
            cpu: String::from_utf8_lossy(hinfo.cpu()).into_owned(),
            os: String::from_utf8_lossy(hinfo.os()).into_owned(),
        },
        RData::TXT(txt) => RecordValue::Text(
            txt.txt_data()
                .iter()
                .map(|chars| String::from_utf8_lossy(chars).into_owned())
                .collect(),
        ),
        other => RecordValue::Other(other.clone()),
    };

    Some(value)
}

/// Project every answer RRset of a response.
fn project_answers(response: &Message) -> LookupResults {
    let mut results = LookupResults::default();

    for record in response.answers() {
        if let Some(value) = project(record) {
            results
                .entry(record.record_type())
                .or_insert_with(Vec::new)
                .push(value);
        }
    }

    results
}

/// A [`Pipeline`] wrapper that turns raw response packets into typed
/// per-record-type value lists.
///
/// # Example
/// ```no_run
/// # use failure::Error;
/// #
/// # fn main() -> Result<(), Error> {
/// use asyncdns::Resolver;
///
/// let resolver = Resolver::new()?;
///
/// for address in &resolver.lookup_address("example.com")?
///     [&asyncdns::dns::RecordType::A]
/// {
///     println!("{:?}", address);
/// }
/// #
/// #     Ok(())
/// # }
/// ```
///
/// [`Pipeline`]: struct.Pipeline.html
pub struct Resolver {
    pipeline: Pipeline,
}

impl Resolver {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            pipeline: Pipeline::new()?,
        })
    }

    pub fn with_config(config: &PipelineConfig) -> Result<Self, Error> {
        Ok(Self {
            pipeline: config.build()?,
        })
    }

    /// The underlying pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Blocking lookup: the first successful response, projected.
    pub fn lookup(&self, query: &Query) -> Result<LookupResults, Error> {
        let (_nameserver, response) = self.pipeline.query(query)?;

        Ok(project_answers(&response))
    }

    /// Fan the lookup out and return immediately; the callback receives
    /// the projected outcome of every nameserver, along with the queried
    /// name.
    pub fn lookup_with(
        &self,
        query: &Query,
        callback: LookupCallback,
    ) -> Result<(), Error> {
        let qname = query.qname().clone();

        self.pipeline.submit(query, move |nameserver, answer| {
            let outcome = answer.map(|response| project_answers(&response));
            (*callback)(nameserver, qname.clone(), outcome);
        })
    }

    fn lookup_rdtype(
        &self,
        qname: &str,
        rdtype: RecordType,
    ) -> Result<LookupResults, Error> {
        let mut query = Query::new(qname)?;
        query.set_rdtype(rdtype);

        self.lookup(&query)
    }

    /// `A` records.
    pub fn lookup_address(&self, qname: &str) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::A)
    }

    /// `AAAA` records.
    pub fn lookup_ipv6_address(
        &self,
        qname: &str,
    ) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::AAAA)
    }

    /// `MX` records.
    pub fn lookup_mail_exchange(
        &self,
        qname: &str,
    ) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::MX)
    }

    /// `NS` records.
    pub fn lookup_nameservers(
        &self,
        qname: &str,
    ) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::NS)
    }

    /// `CNAME` records.
    pub fn lookup_canonical_name(
        &self,
        qname: &str,
    ) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::CNAME)
    }

    /// `PTR` records.
    pub fn lookup_pointer(&self, qname: &str) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::PTR)
    }

    /// `SOA` records.
    pub fn lookup_authority(
        &self,
        qname: &str,
    ) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::SOA)
    }

    /// `SRV` records.
    pub fn lookup_service(&self, qname: &str) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::SRV)
    }

    /// `HINFO` records.
    pub fn lookup_host_info(
        &self,
        qname: &str,
    ) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::HINFO)
    }

    /// `TXT` records.
    pub fn lookup_text(&self, qname: &str) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::TXT)
    }

    /// `ANY`.
    pub fn lookup_all_records(
        &self,
        qname: &str,
    ) -> Result<LookupResults, Error> {
        self.lookup_rdtype(qname, RecordType::ANY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use hickory_proto::op::{MessageType, OpCode};
    use hickory_proto::rr::rdata::{A, MX, TXT};

    use std::str::FromStr;

    fn name(text: &str) -> Name {
        Name::from_str(text).unwrap()
    }

    fn response_with(records: Vec<Record>) -> Message {
        let mut response = Message::new();
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        for record in records {
            response.add_answer(record);
        }
        response
    }

    #[test]
    fn test_project_addresses() {
        let response = response_with(vec![
            Record::from_rdata(
                name("example.com."),
                300,
                RData::A(A::new(93, 184, 216, 34)),
            ),
            Record::from_rdata(
                name("example.com."),
                300,
                RData::A(A::new(93, 184, 216, 35)),
            ),
        ]);

        let results = project_answers(&response);
        assert_eq!(
            vec![
                RecordValue::Address("93.184.216.34".parse().unwrap()),
                RecordValue::Address("93.184.216.35".parse().unwrap()),
            ],
            results[&RecordType::A]
        );
    }

    #[test]
    fn test_project_mail_exchange() {
        let response = response_with(vec![Record::from_rdata(
            name("example.com."),
            300,
            RData::MX(MX::new(10, name("mail.example.com."))),
        )]);

        let results = project_answers(&response);
        assert_eq!(
            vec![RecordValue::MailExchange {
                preference: 10,
                exchange: name("mail.example.com."),
            }],
            results[&RecordType::MX]
        );
    }

    #[test]
    fn test_project_text_is_lossy() {
        let txt = TXT::from_bytes(vec![&b"plain"[..], &[0xFFu8, 0x61][..]]);
        let response = response_with(vec![Record::from_rdata(
            name("example.com."),
            300,
            RData::TXT(txt),
        )]);

        let results = project_answers(&response);
        match &results[&RecordType::TXT][0] {
            RecordValue::Text(strings) => {
                assert_eq!("plain", strings[0]);
                // The invalid byte is replaced, not dropped.
                assert_eq!("\u{FFFD}a", strings[1]);
            }
            value => panic!("unexpected projection: {:?}", value),
        }
    }

    #[test]
    fn test_mixed_types_group_by_rdtype() {
        let response = response_with(vec![
            Record::from_rdata(
                name("example.com."),
                300,
                RData::A(A::new(93, 184, 216, 34)),
            ),
            Record::from_rdata(
                name("example.com."),
                300,
                RData::MX(MX::new(10, name("mail.example.com."))),
            ),
        ]);

        let results = project_answers(&response);
        assert_eq!(2, results.len());
        assert_eq!(1, results[&RecordType::A].len());
        assert_eq!(1, results[&RecordType::MX].len());
    }
}
