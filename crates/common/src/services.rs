//! Well-known service names for TCP ports

/// Port to conventional service name, sorted by port.
pub const WELL_KNOWN_SERVICES: &[(u16, &str)] = &[
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "dns"),
    (80, "http"),
    (110, "pop3"),
    (111, "rpc"),
    (135, "msrpc"),
    (139, "netbios"),
    (143, "imap"),
    (443, "https"),
    (445, "smb"),
    (465, "smtps"),
    (548, "afp"),
    (587, "submission"),
    (631, "ipp"),
    (993, "imaps"),
    (995, "pop3s"),
    (1433, "mssql"),
    (1521, "oracle"),
    (2049, "nfs"),
    (3306, "mysql"),
    (3389, "rdp"),
    (5432, "postgresql"),
    (5900, "vnc"),
    (5984, "couchdb"),
    (6379, "redis"),
    (8080, "http-alt"),
    (8443, "https-alt"),
    (9100, "jetdirect"),
    (9200, "elasticsearch"),
    (11211, "memcached"),
    (27017, "mongodb"),
];

/// Conventional service name for `port`, if it has one.
#[must_use]
pub fn service_name(port: u16) -> Option<&'static str> {
    WELL_KNOWN_SERVICES
        .binary_search_by_key(&port, |&(p, _)| p)
        .ok()
        .map(|i| WELL_KNOWN_SERVICES[i].1)
}
