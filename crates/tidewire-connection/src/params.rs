//! Builds the URL a connection attempt opens.

use url::Url;

use crate::auth::Credential;
use crate::config::ClientOptions;

/// Protocol version sent as `v`.
pub const PROTOCOL_VERSION: &str = "2";

/// Which previous connection, if any, an attempt continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// A brand-new connection.
    Clean,
    /// Resume the connection this client just lost.
    Resume { key: String, serial: Option<i64> },
    /// Recover a connection from an earlier client instance.
    Recover { key: String, serial: i64 },
}

/// The transport URL for an attempt against `host`.
pub(crate) fn connect_url(
    options: &ClientOptions,
    host: &str,
    credential: Option<&Credential>,
    mode: &ConnectMode,
) -> Result<Url, url::ParseError> {
    let scheme = if options.tls { "wss" } else { "ws" };
    let mut url = Url::parse(&format!("{scheme}://{host}/"))?;
    // Default ports are dropped by `set_port`, so this only shows custom ones.
    if url.set_port(Some(options.resolved_port())).is_err() {
        return Err(url::ParseError::InvalidPort);
    }

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("v", PROTOCOL_VERSION);
        query.append_pair("format", options.format.as_str());
        query.append_pair("echo", if options.echo_messages { "true" } else { "false" });
        query.append_pair("heartbeats", "true");
        if let Some(client_id) = &options.client_id {
            query.append_pair("clientId", client_id);
        }
        match credential {
            Some(Credential::Key(key)) => {
                query.append_pair("key", key);
            }
            Some(Credential::Token(token)) => {
                query.append_pair("accessToken", token);
            }
            None => {}
        }
        match mode {
            ConnectMode::Clean => {}
            ConnectMode::Resume { key, serial } => {
                query.append_pair("resume", key);
                if let Some(serial) = serial {
                    query.append_pair("connection_serial", &serial.to_string());
                }
            }
            ConnectMode::Recover { key, serial } => {
                query.append_pair("recover", key);
                query.append_pair("connection_serial", &serial.to_string());
            }
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tidewire_protocol::Format;

    fn query(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn test_connect_url_clean_with_key() {
        let options = ClientOptions::with_key("app.key:secret");
        let url = connect_url(
            &options,
            "realtime.tidewire.io",
            Some(&Credential::Key("app.key:secret".into())),
            &ConnectMode::Clean,
        )
        .unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("realtime.tidewire.io"));
        assert_eq!(url.port(), None);
        let q = query(&url);
        assert_eq!(q["v"], "2");
        assert_eq!(q["format"], "json");
        assert_eq!(q["echo"], "true");
        assert_eq!(q["heartbeats"], "true");
        assert_eq!(q["key"], "app.key:secret");
        assert!(!q.contains_key("resume"));
        assert!(!q.contains_key("accessToken"));
    }

    #[test]
    fn test_connect_url_resume_with_token_and_custom_port() {
        let options = ClientOptions {
            tls: false,
            port: Some(8080),
            format: Format::MsgPack,
            echo_messages: false,
            client_id: Some("alice".into()),
            ..Default::default()
        };
        let url = connect_url(
            &options,
            "localhost",
            Some(&Credential::Token("tok".into())),
            &ConnectMode::Resume {
                key: "conn-key".into(),
                serial: Some(41),
            },
        )
        .unwrap();

        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(8080));
        let q = query(&url);
        assert_eq!(q["format"], "msgpack");
        assert_eq!(q["echo"], "false");
        assert_eq!(q["clientId"], "alice");
        assert_eq!(q["accessToken"], "tok");
        assert_eq!(q["resume"], "conn-key");
        assert_eq!(q["connection_serial"], "41");
    }

    #[test]
    fn test_connect_url_recover() {
        let options = ClientOptions::default();
        let url = connect_url(
            &options,
            "realtime.tidewire.io",
            None,
            &ConnectMode::Recover {
                key: "old-key".into(),
                serial: 9,
            },
        )
        .unwrap();
        let q = query(&url);
        assert_eq!(q["recover"], "old-key");
        assert_eq!(q["connection_serial"], "9");
    }
}
