//! Proxy records and the credential codec.

use crate::error::{ProxyError, Result};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::HeaderValue;
use std::borrow::Cow;
use std::fmt;

/// Text encoding applied to `user:password` before base64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthEncoding {
    /// ISO-8859-1, one byte per code point up to U+00FF.
    #[default]
    Latin1,
    /// 7-bit US-ASCII; anything above U+007F is unencodable.
    Ascii,
    /// UTF-16 with a little-endian byte order mark.
    Utf16,
    Utf16Le,
    Utf16Be,
    /// Any other encoding `encoding_rs` can encode to.
    Other(&'static encoding_rs::Encoding),
}

impl AuthEncoding {
    /// Resolve an encoding from its label (`latin-1`, `utf-8`, `cp1252`, ...).
    ///
    /// Labels `encoding_rs` can only decode, not encode, are unknown here.
    pub fn for_label(label: &str) -> Result<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace('_', "-");
        let unknown = || ProxyError::UnknownEncoding(label.to_string());
        match normalized.as_str() {
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" | "l1" => Ok(Self::Latin1),
            "ascii" | "us-ascii" | "us" | "646" | "ansi-x3.4-1968" | "cp367" | "csascii" | "ibm367"
            | "iso646-us" => Ok(Self::Ascii),
            "utf-16" | "utf16" => Ok(Self::Utf16),
            "utf-16-le" | "utf-16le" | "utf16le" => Ok(Self::Utf16Le),
            "utf-16-be" | "utf-16be" | "utf16be" => Ok(Self::Utf16Be),
            _ => {
                let encoding = encoding_rs::Encoding::for_label(normalized.as_bytes()).ok_or_else(unknown)?;
                if encoding == encoding_rs::UTF_16LE {
                    Ok(Self::Utf16Le)
                } else if encoding == encoding_rs::UTF_16BE {
                    Ok(Self::Utf16Be)
                } else if encoding.output_encoding() != encoding {
                    Err(unknown())
                } else {
                    Ok(Self::Other(encoding))
                }
            }
        }
    }

    /// Canonical name, as reported in encoding errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Latin1 => "latin-1",
            Self::Ascii => "ascii",
            Self::Utf16 => "utf-16",
            Self::Utf16Le => "utf-16-le",
            Self::Utf16Be => "utf-16-be",
            Self::Other(encoding) => encoding.name(),
        }
    }

    /// Encode `text`, failing if any character is unrepresentable.
    pub fn encode<'a>(&self, text: &'a str) -> Result<Cow<'a, [u8]>> {
        match self {
            Self::Utf16 => {
                let mut bytes = vec![0xFF, 0xFE];
                bytes.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
                Ok(Cow::Owned(bytes))
            }
            Self::Utf16Le => Ok(Cow::Owned(text.encode_utf16().flat_map(u16::to_le_bytes).collect())),
            Self::Utf16Be => Ok(Cow::Owned(text.encode_utf16().flat_map(u16::to_be_bytes).collect())),
            _ if text.is_ascii() && self.is_ascii_compatible() => Ok(Cow::Borrowed(text.as_bytes())),
            Self::Ascii => Err(self.unencodable()),
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).ok())
                .collect::<Option<Vec<u8>>>()
                .map(Cow::Owned)
                .ok_or_else(|| self.unencodable()),
            Self::Other(encoding) => {
                let (bytes, _, had_errors) = encoding.encode(text);
                if had_errors {
                    Err(self.unencodable())
                } else {
                    Ok(bytes)
                }
            }
        }
    }

    fn is_ascii_compatible(&self) -> bool {
        match self {
            Self::Latin1 | Self::Ascii => true,
            Self::Utf16 | Self::Utf16Le | Self::Utf16Be => false,
            Self::Other(encoding) => encoding.is_ascii_compatible(),
        }
    }

    fn unencodable(&self) -> ProxyError {
        ProxyError::Encoding {
            encoding: self.name().to_string(),
        }
    }
}

/// Base64 token sent as `Proxy-Authorization: Basic <token>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Credential(String);

impl Credential {
    /// Build the token from percent-encoded `username` and `password`.
    pub fn basic(username: &str, password: &str, encoding: AuthEncoding) -> Result<Self> {
        let username = urlencoding::decode_binary(username.as_bytes());
        let password = urlencoding::decode_binary(password.as_bytes());
        let plain = format!(
            "{}:{}",
            String::from_utf8_lossy(&username),
            String::from_utf8_lossy(&password)
        );
        let bytes = encoding.encode(&plain)?;
        Ok(Self(STANDARD.encode(bytes)))
    }

    /// Extract the token from a `Basic <token>` header value.
    pub fn from_header(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?;
        let token = value.strip_prefix("Basic")?;
        if !token.starts_with(char::is_whitespace) {
            return None;
        }
        Some(Self(token.trim().to_string()))
    }

    /// The base64 token without the `Basic` prefix.
    pub fn token(&self) -> &str {
        &self.0
    }

    /// `Basic <token>`, ready for `Proxy-Authorization`.
    pub fn header_value(&self) -> Result<HeaderValue> {
        Ok(HeaderValue::from_str(&format!("Basic {}", self.0))?)
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pieces of a raw proxy URL; credentials are still percent-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyUrlParts<'a> {
    pub scheme: Option<&'a str>,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub host_port: &'a str,
}

/// Split `[scheme://][user[:password]@]host[:port][/...]`.
///
/// Input without `//` after the colon is read as a bare authority, so
/// `proxy:3128` is a host and port, not a scheme.
pub fn split_proxy_url(raw: &str) -> Result<ProxyUrlParts<'_>> {
    let invalid = |reason| ProxyError::InvalidProxyUrl {
        url: raw.to_string(),
        reason,
    };

    let (scheme, authority) = match raw.split_once(':') {
        Some((scheme, rest)) if !scheme.is_empty() && !scheme.contains('/') && rest.starts_with('/') => {
            let after = rest.strip_prefix("//").ok_or_else(|| invalid("no authority"))?;
            let from = after.find('@').unwrap_or(0);
            let end = after[from..].find('/').map_or(after.len(), |i| from + i);
            (Some(scheme), &after[..end])
        }
        _ => (None, raw),
    };

    let (userinfo, host_port) = match authority.rsplit_once('@') {
        Some((userinfo, host_port)) => (Some(userinfo), host_port),
        None => (None, authority),
    };
    if host_port.is_empty() {
        return Err(invalid("missing host"));
    }

    let (username, password) = match userinfo {
        Some(userinfo) => match userinfo.split_once(':') {
            Some((user, password)) => (Some(user), Some(password)),
            None => (Some(userinfo), None),
        },
        None => (None, None),
    };

    Ok(ProxyUrlParts {
        scheme,
        username,
        password,
        host_port,
    })
}

/// A normalized proxy and the credential to present to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyRecord {
    credential: Option<Credential>,
    url: String,
}

impl ProxyRecord {
    /// Wrap an already normalized URL.
    pub fn new(url: impl Into<String>, credential: Option<Credential>) -> Self {
        Self {
            credential,
            url: url.into(),
        }
    }

    /// Parse a raw proxy URL, substituting `default_scheme` when it has none.
    ///
    /// The result is `scheme://host:port`; path, query and fragment are dropped.
    /// A username yields a credential even when the password is empty or missing.
    pub fn parse(raw: &str, default_scheme: &str, encoding: AuthEncoding) -> Result<Self> {
        let parts = split_proxy_url(raw)?;
        let scheme = match parts.scheme {
            Some(scheme) => scheme.to_ascii_lowercase(),
            None => default_scheme.to_string(),
        };

        let credential = match parts.username.filter(|user| !user.is_empty()) {
            Some(user) => Some(Credential::basic(
                user,
                parts.password.unwrap_or_default(),
                encoding,
            )?),
            None => None,
        };

        Ok(Self {
            credential,
            url: format!("{}://{}", scheme, parts.host_port),
        })
    }

    /// Replace the credential, keeping the URL.
    pub fn with_credential(self, credential: Option<Credential>) -> Self {
        Self { credential, ..self }
    }

    /// Credential sent to this proxy, if any.
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// `scheme://host:port`, without credentials.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The invalidation key of this record under `scheme`.
    pub fn entry(&self, scheme: &str) -> ProxyEntry {
        ProxyEntry::new(scheme, self.credential.clone(), self.url.clone())
    }
}

/// `(scheme, credential, url)`, the unit of invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyEntry {
    pub scheme: String,
    pub credential: Option<Credential>,
    pub url: String,
}

impl ProxyEntry {
    pub fn new(scheme: impl Into<String>, credential: Option<Credential>, url: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            credential,
            url: url.into(),
        }
    }
}

impl fmt::Display for ProxyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credential {
            Some(_) => write!(f, "{} via {} (authenticated)", self.scheme, self.url),
            None => write!(f, "{} via {}", self.scheme, self.url),
        }
    }
}
