/*!
A parser for an INI file with the following structure:

```ini
[Connection]
uri=tcp:0.0.0.0:6633

; A TLS connection setup:
; uri=tls:0.0.0.0:6633
; pkcs12=/etc/polyflow.p12
; passwd=s3cr3t

[Runtime]
verbose=false
; eager | lazy_on_topology_change | lazy_on_first_pkt
compile=eager
; controller_fallback | drop
unsupported=controller_fallback
recursion_limit=16
background=true
```

Both sections are optional. Missing keys take the values shown.
*/

use crate::openflow::messages::OFP_TCP_PORT;
use crate::runtime::{CompileStrategy, RuntimeConfig};

use ini::ini;
use ini::Ini;

use std::convert::From;
use std::default::Default;
use std::error;
use std::fmt;
#[cfg(feature = "tls")]
use std::fs::File;
use std::io;
#[cfg(feature = "tls")]
use std::io::Read;
use std::net::*;
use std::str::FromStr;

#[cfg(feature = "tls")]
use tls_api::TlsAcceptorBuilder;

const CONN_SECTION: &str = "Connection";
const URI_KEY: &str = "uri";
#[cfg(feature = "tls")]
const P12_KEY: &str = "pkcs12";
#[cfg(feature = "tls")]
const PASS_KEY: &str = "passwd";

const RUNTIME_SECTION: &str = "Runtime";
const VERBOSE_KEY: &str = "verbose";
const COMPILE_KEY: &str = "compile";
const UNSUPPORTED_KEY: &str = "unsupported";
const RECURSION_KEY: &str = "recursion_limit";
const BACKGROUND_KEY: &str = "background";

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Ini(ini::Error),
    MissingEntry(&'static str, &'static str),
    InvalidUri,
    InvalidValue(&'static str, &'static str, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "{}", e),
            Error::Ini(ref e) => write!(f, "{}", e),
            Error::MissingEntry(s, k) => {
                write!(f, "The INI [{}] section does not have a '{}' key", s, k)
            }
            Error::InvalidUri => write!(f, "The OpenFlow Connection URI from INI file is invalid"),
            Error::InvalidValue(s, k, ref v) => {
                write!(f, "The INI [{}] section has an invalid '{}' value: {}", s, k, v)
            }
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(ioe) => ioe,
            _ => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        "INI configuration parser error"
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ConnectionProtocol {
    Tcp,
    #[cfg(feature = "tls")]
    Tls,
}
impl FromStr for ConnectionProtocol {
    type Err = Error;

    fn from_str(proto: &str) -> Result<ConnectionProtocol, Self::Err> {
        match proto {
            "tcp" => Ok(ConnectionProtocol::Tcp),
            #[cfg(feature = "tls")]
            "tls" => Ok(ConnectionProtocol::Tls),
            _ => Err(Error::InvalidUri),
        }
    }
}

trait Section {
    type S;

    fn from_ini(conf: &Ini) -> Result<Self::S, Error>;
}

/// Where switches connect to
#[derive(Debug, Clone)]
pub struct OfConnection {
    proto: ConnectionProtocol,
    pub socket: SocketAddr,
    pkcs12: Option<(Vec<u8>, String)>,
}
#[cfg(feature = "tls")]
impl OfConnection {
    pub fn tls_acceptor(&self) -> tls_api::Result<Option<tls_api_openssl::TlsAcceptor>> {
        Ok(match self.pkcs12 {
            Some(ref p12) => {
                Some(tls_api_openssl::TlsAcceptorBuilder::from_pkcs12(&p12.0, &p12.1)?.build()?)
            }
            _ => None,
        })
    }
}
impl Section for OfConnection {
    type S = OfConnection;

    fn from_ini(conf: &Ini) -> Result<Self::S, Error> {
        debug!("Reading [{}] section", CONN_SECTION);

        match conf.section(Some(CONN_SECTION.to_owned())) {
            Some(conn_section) => {
                let uri = match conn_section.get(URI_KEY) {
                    Some(uri) => uri,
                    None => return Ok(OfConnection::default()),
                };
                #[allow(unused_mut)]
                let mut conn = OfConnection::from_str(uri)?;

                #[cfg(feature = "tls")]
                {
                    if conn.proto == ConnectionProtocol::Tls {
                        let path = conn_section
                            .get(P12_KEY)
                            .ok_or(Error::MissingEntry(CONN_SECTION, P12_KEY))?;
                        let mut p12 = vec![];
                        File::open(path)?.read_to_end(&mut p12)?;
                        let passwd = conn_section
                            .get(PASS_KEY)
                            .ok_or(Error::MissingEntry(CONN_SECTION, PASS_KEY))?;
                        conn.pkcs12 = Some((p12, passwd.to_owned()));
                    }
                }
                Ok(conn)
            }
            _ => Ok(OfConnection::default()),
        }
    }
}

impl FromStr for OfConnection {
    type Err = Error;

    fn from_str(conn: &str) -> Result<OfConnection, Self::Err> {
        let def_port = OFP_TCP_PORT.to_string();
        let mut conn_split: Vec<_> = conn.split(':').collect();
        if conn_split.len() == 2 {
            conn_split.push(&def_port);
        }
        if conn_split.len() == 3 {
            let joined = &format!("{}:{}", conn_split[1], conn_split[2]);
            if let Ok(socket) = SocketAddr::from_str(joined) {
                let connection = OfConnection {
                    proto: ConnectionProtocol::from_str(conn_split[0])?,
                    socket: socket,
                    pkcs12: None,
                };
                debug!("Got {:?}", connection);
                return Ok(connection);
            }
        }
        Err(Error::InvalidUri)
    }
}

impl Default for OfConnection {
    fn default() -> Self {
        let socket_v4 = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), OFP_TCP_PORT);
        OfConnection {
            proto: ConnectionProtocol::Tcp,
            socket: SocketAddr::V4(socket_v4),
            pkcs12: None,
        }
    }
}

/// Parses the value of `key` if it is present
fn value<T: FromStr>(props: &ini::Properties, key: &'static str) -> Result<Option<T>, Error> {
    match props.get(key) {
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidValue(RUNTIME_SECTION, key, v.to_string())),
        None => Ok(None),
    }
}

impl Section for RuntimeConfig {
    type S = RuntimeConfig;

    fn from_ini(conf: &Ini) -> Result<Self::S, Error> {
        debug!("Reading [{}] section", RUNTIME_SECTION);

        let mut config = RuntimeConfig::default();
        if let Some(section) = conf.section(Some(RUNTIME_SECTION.to_owned())) {
            if let Some(verbose) = value(section, VERBOSE_KEY)? {
                config.verbose = verbose;
            }
            if let Some(strategy) = value::<CompileStrategy>(section, COMPILE_KEY)? {
                config.strategy = strategy;
            }
            if let Some(unsupported) = value(section, UNSUPPORTED_KEY)? {
                config.unsupported = unsupported;
            }
            if let Some(limit) = value::<usize>(section, RECURSION_KEY)? {
                if limit == 0 {
                    return Err(Error::InvalidValue(RUNTIME_SECTION, RECURSION_KEY, limit.to_string()));
                }
                config.recursion_limit = limit;
            }
            if let Some(background) = value(section, BACKGROUND_KEY)? {
                config.background = background;
            }
        }

        debug!("Got {:?}", config);
        Ok(config)
    }
}

/// Reads both sections of a loaded INI file
pub fn parse(conf: &Ini) -> Result<(OfConnection, RuntimeConfig), Error> {
    Ok((OfConnection::from_ini(conf)?, RuntimeConfig::from_ini(conf)?))
}

pub fn parse_file(path: &str) -> Result<(OfConnection, RuntimeConfig), Error> {
    info!("Reading INI file {}", path);

    let conf = match Ini::load_from_file(path) {
        Ok(i) => i,
        Err(e) => {
            return Err(Error::Ini(e));
        }
    };

    parse(&conf)
}
