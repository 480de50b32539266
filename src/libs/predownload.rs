// The pre-downloader: a streaming HTTPS fetcher feeding SHA-256 while it
// writes, backed by a content-addressed cache under cache/downloads/.
//
// Security posture, in order of suspicion:
//   - HTTPS only, including every redirect hop (no downgrade).
//   - Redirects are followed manually so each destination is re-checked
//     against private, loopback and link-local address space.
//   - A hard size cap is enforced mid-stream, not after the fact.
//   - Transport compression is refused; archives are decompressed by the
//     `extract` primitive under its own bomb guards, never by the client.
//   - Cache writers stage to `<hash>.tmp` and rename; a corrupt cache
//     entry is treated as a miss and unlinked.

use std::fs;
use std::io::Read;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;

use url::Url;

use crate::error::{Result, TsukuError};
use crate::libs::cancel::CancelToken;
use crate::libs::config::Settings;
use crate::libs::utilities::checksum::{copy_hashed, is_sha256_hex, sha256_file};
use crate::{log_debug, log_info};

const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = concat!("tsuku/", env!("CARGO_PKG_VERSION"));

/// A completed pre-download. `path` points into the download cache.
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub from_cache: bool,
}

pub struct Predownloader<'a> {
    settings: &'a Settings,
    cancel: CancelToken,
}

impl<'a> Predownloader<'a> {
    pub fn new(settings: &'a Settings, cancel: CancelToken) -> Self {
        Self { settings, cancel }
    }

    /// Fetches `url`, returning the cached path and digest. When
    /// `expected_sha256` is known and the cache already holds that object,
    /// the network is skipped entirely.
    pub fn fetch(&self, url: &str, expected_sha256: Option<&str>) -> Result<Download> {
        if let Some(expected) = expected_sha256 {
            if !is_sha256_hex(expected) {
                return Err(TsukuError::Integrity(format!(
                    "malformed expected checksum: {expected}"
                )));
            }
            if let Some(hit) = self.cache_lookup(expected)? {
                log_debug!("[Download] Cache hit for {} ({})", url, &expected[..12]);
                return Ok(hit);
            }
        }

        let (sha256, size, temp_path) = self.stream_to_temp(url, expected_sha256)?;

        if let Some(expected) = expected_sha256 {
            if sha256 != expected {
                let _ = fs::remove_file(&temp_path);
                return Err(TsukuError::Integrity(format!(
                    "checksum mismatch for {url}: expected {expected}, got {sha256}"
                )));
            }
        }

        // Promote the verified payload into the content-addressed cache.
        let cache_path = self.settings.downloads_dir().join(&sha256);
        fs::create_dir_all(self.settings.downloads_dir())?;
        fs::rename(&temp_path, &cache_path)?;
        log_info!("[Download] Fetched {} ({} bytes)", url, size);

        Ok(Download { path: cache_path, sha256, size, from_cache: false })
    }

    /// Checks the CAS for an object, verifying it still matches its name.
    /// A corrupt entry is unlinked and reported as a miss.
    fn cache_lookup(&self, sha256: &str) -> Result<Option<Download>> {
        let path = self.settings.downloads_dir().join(sha256);
        if !path.is_file() {
            return Ok(None);
        }
        match sha256_file(&path) {
            Ok(actual) if actual == sha256 => {
                let size = fs::metadata(&path)?.len();
                Ok(Some(Download { path, sha256: sha256.to_string(), size, from_cache: true }))
            }
            _ => {
                log_debug!("[Download] Dropping corrupt cache entry {}", path.display());
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    /// Follows redirects manually, streaming the final body into a private
    /// temp file while hashing. Partial writes are unlinked on any failure.
    fn stream_to_temp(
        &self,
        original_url: &str,
        _expected: Option<&str>,
    ) -> Result<(String, u64, PathBuf)> {
        let mut current = original_url.to_string();

        for _hop in 0..=MAX_REDIRECTS {
            self.cancel.check()?;
            check_url_allowed(&current)?;

            let agent = ureq::AgentBuilder::new()
                .redirects(0)
                .timeout_connect(self.settings.timeouts.connect)
                .timeout(self.settings.timeouts.download_total)
                .try_proxy_from_env(true)
                .build();

            let response = agent
                .get(&current)
                .set("User-Agent", USER_AGENT)
                .set("Accept-Encoding", "identity")
                .call()
                .map_err(|e| TsukuError::Network {
                    url: current.clone(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if (301..=308).contains(&status) {
                let location = response.header("location").ok_or_else(|| TsukuError::Network {
                    url: current.clone(),
                    reason: format!("redirect ({status}) without a Location header"),
                })?;
                let base = Url::parse(&current).map_err(|e| TsukuError::Network {
                    url: current.clone(),
                    reason: e.to_string(),
                })?;
                let next = base.join(location).map_err(|e| TsukuError::Network {
                    url: current.clone(),
                    reason: format!("unparseable redirect target: {e}"),
                })?;
                log_debug!("[Download] Redirect {} -> {}", current, next);
                current = next.to_string();
                continue;
            }

            if status >= 400 {
                return Err(TsukuError::Network {
                    url: current,
                    reason: format!("server returned HTTP {status}"),
                });
            }

            let declared: Option<u64> =
                response.header("content-length").and_then(|v| v.parse().ok());
            if let Some(size) = declared {
                if size > self.settings.download_size_cap {
                    return Err(TsukuError::Integrity(format!(
                        "declared size {size} exceeds the download cap of {}",
                        self.settings.download_size_cap
                    )));
                }
            }

            return self.write_body(&current, response.into_reader(), declared);
        }

        Err(TsukuError::Network {
            url: original_url.to_string(),
            reason: format!("more than {MAX_REDIRECTS} redirects"),
        })
    }

    fn write_body(
        &self,
        url: &str,
        mut body: impl Read,
        declared: Option<u64>,
    ) -> Result<(String, u64, PathBuf)> {
        fs::create_dir_all(self.settings.downloads_dir())?;
        // tempfile creates with mode 0600 on Unix; keep it in the cache dir
        // so the final rename never crosses filesystems.
        let temp = tempfile::Builder::new()
            .prefix(".fetch-")
            .suffix(".tmp")
            .tempfile_in(self.settings.downloads_dir())?;

        // Allow modest slack over the declared size before tripping; lies
        // beyond that are treated as hostile.
        let cap = match declared {
            Some(size) => (size + size / 8 + 4096).min(self.settings.download_size_cap),
            None => self.settings.download_size_cap,
        };

        // Transfer budget: the flat default, or scaled up for payloads
        // that declare a large size.
        let deadline =
            std::time::Instant::now() + self.settings.timeouts.download_budget(declared);

        let cancel = self.cancel.clone();
        let mut file = temp.as_file();
        let result = copy_hashed(&mut body, &mut file, cap, || {
            if cancel.is_cancelled() {
                return Err(std::io::Error::other("cancelled"));
            }
            if std::time::Instant::now() >= deadline {
                return Err(std::io::Error::other("transfer budget exhausted"));
            }
            Ok(())
        });

        match result {
            Ok((sha256, size)) => {
                if size == 0 {
                    return Err(TsukuError::Network {
                        url: url.to_string(),
                        reason: "empty response body".to_string(),
                    });
                }
                // keep() detaches the file from auto-deletion; the caller
                // renames it into the CAS.
                let (_file, path) = temp.keep().map_err(|e| TsukuError::State(e.to_string()))?;
                Ok((sha256, size, path))
            }
            Err(err) if err.to_string().contains("cancelled") => Err(TsukuError::Cancelled),
            Err(err) if err.to_string().contains("size cap") => Err(TsukuError::Integrity(
                format!("{url}: {err}"),
            )),
            Err(err) => Err(TsukuError::Network { url: url.to_string(), reason: err.to_string() }),
        }
    }
}

/// HTTPS enforcement plus the SSRF guard: the URL must be https and its
/// host must not resolve into private, loopback or link-local space.
pub fn check_url_allowed(raw: &str) -> Result<()> {
    let parsed = Url::parse(raw).map_err(|e| TsukuError::Network {
        url: raw.to_string(),
        reason: format!("unparseable URL: {e}"),
    })?;

    if parsed.scheme() != "https" {
        return Err(TsukuError::Network {
            url: raw.to_string(),
            reason: format!("refusing non-HTTPS scheme '{}'", parsed.scheme()),
        });
    }

    let host = parsed.host_str().ok_or_else(|| TsukuError::Network {
        url: raw.to_string(),
        reason: "URL has no host".to_string(),
    })?;
    let port = parsed.port_or_known_default().unwrap_or(443);

    // Resolve and check every address; a name that maps to any internal
    // address is rejected wholesale.
    let addrs = (host, port).to_socket_addrs().map_err(|e| TsukuError::Network {
        url: raw.to_string(),
        reason: format!("cannot resolve host '{host}': {e}"),
    })?;
    for addr in addrs {
        if is_internal_address(&addr.ip()) {
            return Err(TsukuError::Network {
                url: raw.to_string(),
                reason: format!("host '{host}' resolves to internal address {}", addr.ip()),
            });
        }
    }
    Ok(())
}

/// RFC 1918, loopback, link-local, unspecified, and their IPv6 relatives.
fn is_internal_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (segments[0] & 0xffc0) == 0xfe80
                // v4-mapped internal addresses
                || v6.to_ipv4_mapped().map(|v4| is_internal_address(&IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn http_scheme_is_refused() {
        let err = check_url_allowed("http://example.com/a").unwrap_err();
        assert!(err.to_string().contains("non-HTTPS"));
    }

    #[test]
    fn literal_internal_hosts_are_refused() {
        assert!(check_url_allowed("https://127.0.0.1/x").is_err());
        assert!(check_url_allowed("https://10.0.0.8/x").is_err());
        assert!(check_url_allowed("https://192.168.1.1/x").is_err());
        assert!(check_url_allowed("https://169.254.169.254/meta").is_err());
        assert!(check_url_allowed("https://[::1]/x").is_err());
    }

    #[test]
    fn internal_address_table() {
        assert!(is_internal_address(&IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert!(is_internal_address(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_internal_address(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_internal_address(&"fe80::1".parse::<IpAddr>().unwrap()));
        assert!(is_internal_address(&"fd12::1".parse::<IpAddr>().unwrap()));
        assert!(!is_internal_address(&IpAddr::V4(Ipv4Addr::new(140, 82, 112, 3))));
        assert!(!is_internal_address(&"2606:4700::1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn cache_lookup_verifies_and_drops_corrupt_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::with_home(tmp.path().to_path_buf());
        std::fs::create_dir_all(settings.downloads_dir()).unwrap();

        // A cache entry whose content does not match its name.
        let bogus_name = "a".repeat(64);
        let bogus = settings.downloads_dir().join(&bogus_name);
        std::fs::write(&bogus, b"not the right bytes").unwrap();

        let fetcher = Predownloader::new(&settings, CancelToken::new());
        assert!(fetcher.cache_lookup(&bogus_name).unwrap().is_none());
        assert!(!bogus.exists(), "corrupt entry should be unlinked");

        // A well-formed entry round-trips.
        let payload = b"cached payload";
        let digest = crate::libs::utilities::checksum::sha256_bytes(payload);
        std::fs::write(settings.downloads_dir().join(&digest), payload).unwrap();
        let hit = fetcher.cache_lookup(&digest).unwrap().unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.size, payload.len() as u64);
    }

    #[test]
    fn malformed_expected_checksum_is_an_integrity_error() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::with_home(tmp.path().to_path_buf());
        let fetcher = Predownloader::new(&settings, CancelToken::new());
        let err = fetcher.fetch("https://example.com/x", Some("nothex")).unwrap_err();
        assert_eq!(err.kind(), "integrity");
    }
}
