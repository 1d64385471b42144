//! Kafka topic derivation: templates with `{{placeholder}}` substitution,
//! group matching rules, and the per-session memoizing builder.

use ipnet::IpNet;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_GROUP: &str = "default";

/// Topic templates from configuration.
#[derive(Debug, Clone)]
pub struct TopicTemplates {
    pub collector: String,
    pub router: String,
    pub bmp_raw: String,
}

impl Default for TopicTemplates {
    fn default() -> Self {
        TopicTemplates {
            collector: "openbmp.collector".to_string(),
            router: "openbmp.router".to_string(),
            bmp_raw: "openbmp.bmp_raw".to_string(),
        }
    }
}

/// One named group with its ordered match rules.
#[derive(Debug, Clone)]
pub struct GroupRule {
    pub name: String,
    pub hostname_patterns: Vec<Regex>,
    pub prefix_ranges: Vec<IpNet>,
    pub asns: Vec<u32>,
}

/// Compiled grouping configuration, shared read-only across workers.
#[derive(Debug, Clone, Default)]
pub struct GroupRules {
    pub routers: Vec<GroupRule>,
    pub peers: Vec<GroupRule>,
}

#[derive(Debug, Error)]
pub enum GroupRuleError {
    #[error("group {group}: bad hostname regexp {pattern:?}: {source}")]
    BadRegexp {
        group: String,
        pattern: String,
        source: regex::Error,
    },
    #[error("group {group}: bad prefix range {range:?}: {source}")]
    BadPrefixRange {
        group: String,
        range: String,
        source: ipnet::AddrParseError,
    },
}

impl GroupRule {
    /// Compiles one rule set; regexes are case-insensitive. Compilation
    /// failures are configuration errors surfaced at load time.
    pub fn compile(
        name: &str,
        hostname_patterns: &[String],
        prefix_ranges: &[String],
        asns: &[u32],
    ) -> Result<Self, GroupRuleError> {
        let hostname_patterns = hostname_patterns
            .iter()
            .map(|p| {
                regex::RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| GroupRuleError::BadRegexp {
                        group: name.to_string(),
                        pattern: p.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let prefix_ranges = prefix_ranges
            .iter()
            .map(|r| {
                r.parse::<IpNet>()
                    .map_err(|source| GroupRuleError::BadPrefixRange {
                        group: name.to_string(),
                        range: r.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GroupRule {
            name: name.to_string(),
            hostname_patterns,
            prefix_ranges,
            asns: asns.to_vec(),
        })
    }
}

/// Rule evaluation order: hostname regexp, then prefix containment, then
/// (peers only) exact ASN, then the default group. First match wins within
/// each pass, in configuration order.
fn match_group<'a>(
    rules: &'a [GroupRule],
    hostname: Option<&str>,
    addr: Option<IpAddr>,
    asn: Option<u32>,
) -> &'a str {
    if let Some(hostname) = hostname.filter(|h| !h.is_empty()) {
        for rule in rules {
            if rule.hostname_patterns.iter().any(|re| re.is_match(hostname)) {
                return &rule.name;
            }
        }
    }
    if let Some(addr) = addr {
        for rule in rules {
            if rule.prefix_ranges.iter().any(|net| net.contains(&addr)) {
                return &rule.name;
            }
        }
    }
    if let Some(asn) = asn {
        for rule in rules {
            if rule.asns.contains(&asn) {
                return &rule.name;
            }
        }
    }
    DEFAULT_GROUP
}

pub fn match_router_group<'a>(
    rules: &'a GroupRules,
    hostname: &str,
    addr: IpAddr,
) -> &'a str {
    match_group(&rules.routers, Some(hostname), Some(addr), None)
}

pub fn match_peer_group<'a>(
    rules: &'a GroupRules,
    hostname: Option<&str>,
    addr: IpAddr,
    asn: u32,
) -> &'a str {
    match_group(&rules.peers, hostname, Some(addr), Some(asn))
}

/// Reverse-DNS hook. Injected so the daemon can plug in a real resolver and
/// tests stay deterministic and DNS-free.
pub type HostnameResolver = Arc<dyn Fn(IpAddr) -> Option<String> + Send + Sync>;

/// Resolver that never resolves: every lookup falls back to the IP literal.
pub fn no_resolver() -> HostnameResolver {
    Arc::new(|_| None)
}

/// Renders the collector topic. Computed once per process.
pub fn collector_topic(
    templates: &TopicTemplates,
    collector_group: &str,
    collector_name: &str,
) -> String {
    templates
        .collector
        .replace("{{collector_group}}", collector_group)
        .replace("{{collector_name}}", collector_name)
}

/// Per-session topic builder: resolves templates against router identity
/// once, and against peer identity at most once per `(peer_ip, peer_asn)`.
pub struct TopicBuilder {
    templates: Arc<TopicTemplates>,
    rules: Arc<GroupRules>,
    resolver: HostnameResolver,
    collector_group: String,
    collector_name: String,
    router_ip: String,
    router_hostname: String,
    router_group: String,
    // template placeholder needs, checked once like the original builder
    raw_needs_peer_group: bool,
    router_topic: Option<Arc<str>>,
    raw_topics: HashMap<Option<(IpAddr, u32)>, Arc<str>>,
    peer_hostnames: HashMap<IpAddr, Option<String>>,
}

impl TopicBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        templates: Arc<TopicTemplates>,
        rules: Arc<GroupRules>,
        resolver: HostnameResolver,
        collector_group: String,
        collector_name: String,
        router_ip: IpAddr,
        router_hostname: String,
        router_group: String,
    ) -> Self {
        let raw_needs_peer_group = templates.bmp_raw.contains("{{peer_group}}");
        TopicBuilder {
            templates,
            rules,
            resolver,
            collector_group,
            collector_name,
            router_ip: router_ip.to_string(),
            router_hostname,
            router_group,
            raw_needs_peer_group,
            router_topic: None,
            raw_topics: HashMap::new(),
            peer_hostnames: HashMap::new(),
        }
    }

    pub fn router_group(&self) -> &str {
        &self.router_group
    }

    fn render_router_scope(&self, template: &str) -> String {
        template
            .replace("{{collector_group}}", &self.collector_group)
            .replace("{{collector_name}}", &self.collector_name)
            .replace("{{router_group}}", &self.router_group)
            .replace("{{router_hostname}}", &self.router_hostname)
            .replace("{{router_ip}}", &self.router_ip)
    }

    /// Router topic, rendered on first use and cached for the session.
    pub fn router_topic(&mut self) -> Arc<str> {
        if let Some(topic) = &self.router_topic {
            return topic.clone();
        }
        let topic: Arc<str> = self.render_router_scope(&self.templates.router).into();
        self.router_topic = Some(topic.clone());
        topic
    }

    /// bmp_raw topic for a peer (or for peerless messages under `None`),
    /// memoized for the session.
    pub fn bmp_raw_topic(&mut self, peer: Option<(IpAddr, u32)>) -> Arc<str> {
        if let Some(topic) = self.raw_topics.get(&peer) {
            return topic.clone();
        }

        let mut topic = self.render_router_scope(&self.templates.bmp_raw);
        let (peer_ip, peer_asn) = match peer {
            Some((ip, asn)) => (ip.to_string(), asn),
            None => (String::new(), 0),
        };
        topic = topic
            .replace("{{peer_asn}}", &peer_asn.to_string())
            .replace("{{peer_ip}}", &peer_ip);
        if self.raw_needs_peer_group {
            let group = match peer {
                Some((ip, asn)) => {
                    let hostname = self.peer_hostname(ip);
                    match_peer_group(&self.rules, hostname.as_deref(), ip, asn).to_string()
                }
                None => DEFAULT_GROUP.to_string(),
            };
            topic = topic.replace("{{peer_group}}", &group);
        }

        let topic: Arc<str> = topic.into();
        self.raw_topics.insert(peer, topic.clone());
        topic
    }

    /// Reverse resolution, at most once per distinct peer IP.
    fn peer_hostname(&mut self, addr: IpAddr) -> Option<String> {
        self.peer_hostnames
            .entry(addr)
            .or_insert_with(|| (self.resolver)(addr))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rules() -> GroupRules {
        GroupRules {
            routers: vec![
                GroupRule::compile("edge", &["^edge-.*".into()], &[], &[]).unwrap(),
                GroupRule::compile("lab", &[], &["192.0.2.0/24".into()], &[]).unwrap(),
            ],
            peers: vec![
                GroupRule::compile("transit", &["(?i)TRANSIT".into()], &[], &[]).unwrap(),
                GroupRule::compile("ixp", &[], &["2001:db8::/32".into()], &[]).unwrap(),
                GroupRule::compile("as65010", &[], &[], &[65010]).unwrap(),
            ],
        }
    }

    fn builder(templates: TopicTemplates, resolver: HostnameResolver) -> TopicBuilder {
        TopicBuilder::new(
            Arc::new(templates),
            Arc::new(rules()),
            resolver,
            "collectors".to_string(),
            "c1".to_string(),
            IpAddr::from_str("192.0.2.9").unwrap(),
            "edge-nyc01".to_string(),
            "edge".to_string(),
        )
    }

    #[test]
    fn router_group_matching_order() {
        let rules = rules();
        // regexp wins over prefix
        assert_eq!(
            match_router_group(&rules, "EDGE-ams02", IpAddr::from_str("192.0.2.5").unwrap()),
            "edge"
        );
        // falls through to prefix
        assert_eq!(
            match_router_group(&rules, "core-1", IpAddr::from_str("192.0.2.5").unwrap()),
            "lab"
        );
        // nothing matches
        assert_eq!(
            match_router_group(&rules, "core-1", IpAddr::from_str("203.0.113.1").unwrap()),
            DEFAULT_GROUP
        );
    }

    #[test]
    fn peer_group_falls_back_to_asn() {
        let rules = rules();
        assert_eq!(
            match_peer_group(&rules, None, IpAddr::from_str("10.9.9.9").unwrap(), 65010),
            "as65010"
        );
        assert_eq!(
            match_peer_group(
                &rules,
                None,
                IpAddr::from_str("2001:db8::77").unwrap(),
                65010
            ),
            "ixp"
        );
    }

    #[test]
    fn bad_regexp_is_a_load_error() {
        assert!(GroupRule::compile("broken", &["(unclosed".into()], &[], &[]).is_err());
        assert!(GroupRule::compile("broken", &[], &["10.0.0.0/33".into()], &[]).is_err());
    }

    #[test]
    fn topics_substitute_all_placeholders() {
        let templates = TopicTemplates {
            collector: "{{collector_group}}.collector.{{collector_name}}".to_string(),
            router: "{{router_group}}.router.{{router_hostname}}".to_string(),
            bmp_raw: "{{router_group}}.bmp.{{peer_group}}.{{peer_asn}}.{{peer_ip}}".to_string(),
        };
        assert_eq!(
            collector_topic(&templates, "collectors", "c1"),
            "collectors.collector.c1"
        );

        let mut b = builder(templates, no_resolver());
        assert_eq!(&*b.router_topic(), "edge.router.edge-nyc01");
        let topic = b.bmp_raw_topic(Some((IpAddr::from_str("10.0.0.1").unwrap(), 65010)));
        assert_eq!(&*topic, "edge.bmp.as65010.65010.10.0.0.1");
    }

    #[test]
    fn resolution_is_deterministic_and_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting = {
            let calls = calls.clone();
            Arc::new(move |_: IpAddr| {
                calls.fetch_add(1, Ordering::SeqCst);
                Some("peer-transit-7.example.net".to_string())
            }) as HostnameResolver
        };
        let templates = TopicTemplates {
            bmp_raw: "bmp.{{peer_group}}.{{peer_asn}}".to_string(),
            ..TopicTemplates::default()
        };
        let mut b = builder(templates, counting);
        let peer = Some((IpAddr::from_str("10.0.0.1").unwrap(), 65001));

        let first = b.bmp_raw_topic(peer);
        assert_eq!(&*first, "bmp.transit.65001");
        for _ in 0..10 {
            assert_eq!(b.bmp_raw_topic(peer), first);
        }
        // memoized: the resolver ran exactly once
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn peerless_messages_share_one_topic() {
        let templates = TopicTemplates {
            bmp_raw: "bmp.{{peer_group}}.{{peer_asn}}.{{peer_ip}}".to_string(),
            ..TopicTemplates::default()
        };
        let mut b = builder(templates, no_resolver());
        assert_eq!(&*b.bmp_raw_topic(None), "bmp.default.0.");
    }
}
