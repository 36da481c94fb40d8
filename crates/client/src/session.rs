// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use models::provider::Credentials;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::SdkError,
    soap::{self, xml, Element, MoRef},
    tls::{self, TlsMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Upper bound on any single SDK call
    pub sdk: Duration,
    pub test_connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sdk: Duration::from_secs(30 * 60),
            test_connect: Duration::from_secs(10),
        }
    }
}

impl Timeouts {
    pub fn from_settings(cfg: &config::MigrationConfig) -> Self {
        Self {
            sdk: cfg.sdk_timeout(),
            test_connect: cfg.test_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContent {
    pub root_folder: MoRef,
    pub property_collector: MoRef,
    pub search_index: MoRef,
    pub session_manager: MoRef,
    pub api_version: String,
    pub api_type: String,
}

impl ServiceContent {
    pub fn from_element(returnval: &Element) -> Result<Self, SdkError> {
        let moref = |name: &str| {
            returnval
                .child(name)
                .and_then(Element::moref)
                .ok_or_else(|| SdkError::Xml(format!("service content has no {name}")))
        };
        let about = returnval
            .child("about")
            .ok_or_else(|| SdkError::Xml("service content has no about".into()))?;

        Ok(Self {
            root_folder: moref("rootFolder")?,
            property_collector: moref("propertyCollector")?,
            search_index: moref("searchIndex")?,
            session_manager: moref("sessionManager")?,
            api_version: about.text_of("apiVersion").unwrap_or("").to_owned(),
            api_type: about.text_of("apiType").unwrap_or("").to_owned(),
        })
    }

    /// Whether the endpoint's API version is at least `major.minor`
    pub fn api_at_least(&self, major: u32, minor: u32) -> bool {
        let mut parts = self.api_version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        let have = (parts.next().unwrap_or(0), parts.next().unwrap_or(0));

        have >= (major, minor)
    }
}

/// Normalizes a provider URL to the SDK endpoint, appending `/sdk` to an empty path
pub fn sdk_url(raw: &str) -> Result<Url, SdkError> {
    let mut url = Url::parse(raw)?;
    if url.host_str().is_none() {
        return Err(SdkError::Configuration(format!("url {raw} has no host")));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/sdk");
    }
    // credentials travel in the Login call, never in the URL
    let _ = url.set_username("");
    let _ = url.set_password(None);

    Ok(url)
}

/// An authenticated SOAP session with a vCenter or ESXi endpoint.
///
/// Dropping a session does not log it out, call [`Session::close`].
pub struct Session {
    http: reqwest::Client,
    url: Url,
    timeouts: Timeouts,
    content: ServiceContent,
    fingerprint: Option<String>,
    credentials: Credentials,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url.as_str())
            .field("api_version", &self.content.api_version)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Session {
    pub async fn open(
        url: &str,
        credentials: &Credentials,
        timeouts: Timeouts,
    ) -> Result<Self, SdkError> {
        let url = sdk_url(url)?;
        if credentials.user.is_empty() {
            return Err(SdkError::Configuration("credentials have no user".into()));
        }

        let mode = TlsMode::from_credentials(credentials);
        let plan = tls::prepare(&url, &mode, timeouts.test_connect).await?;

        let http = plan
            .apply(reqwest::Client::builder().cookie_store(true).timeout(timeouts.sdk))?
            .build()?;

        let content = {
            let body = soap::request(
                "RetrieveServiceContent",
                &MoRef::new("ServiceInstance", "ServiceInstance"),
                "",
            );
            let resp = post(&http, &url, "urn:vim25", body, timeouts.sdk).await?;
            let returnval = resp
                .child("returnval")
                .ok_or_else(|| SdkError::Xml("RetrieveServiceContent returned nothing".into()))?;
            ServiceContent::from_element(returnval)?
        };

        let session = Self {
            http,
            url,
            timeouts,
            content,
            fingerprint: plan.fingerprint,
            credentials: credentials.clone(),
            closed: AtomicBool::new(false),
        };

        session.login().await?;

        info!(
            "Opened SDK session to {} (API {})",
            session.url, session.content.api_version
        );

        Ok(session)
    }

    pub fn content(&self) -> &ServiceContent {
        &self.content
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Thumbprint observed while connecting, when the certificate was checked
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    fn soap_action(&self) -> String {
        format!("urn:vim25/{}", self.content.api_version)
    }

    async fn login(&self) -> Result<(), SdkError> {
        let args = format!(
            "{}{}",
            soap::text("userName", &self.credentials.user),
            soap::text("password", &self.credentials.password)
        );
        self.send("Login", &self.content.session_manager, &args)
            .await
            .map(|_| ())
    }

    async fn send(&self, method: &str, this: &MoRef, args: &str) -> Result<Element, SdkError> {
        debug!("SDK call {method} on {this}");
        let body = soap::request(method, this, args);

        post(&self.http, &self.url, &self.soap_action(), body, self.timeouts.sdk).await
    }

    /// Invokes `method` on `this`, returning the response element.
    ///
    /// A session the endpoint has expired is logged in again once and the
    /// call repeated.
    pub async fn call(&self, method: &str, this: &MoRef, args: &str) -> Result<Element, SdkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SdkError::NotAuthenticated);
        }

        match self.send(method, this, args).await {
            Err(SdkError::NotAuthenticated) if method != "Logout" => {
                warn!("Session to {} expired during {method}, logging in again", self.url);
                self.login().await?;
                self.send(method, this, args).await
            }
            r => r,
        }
    }

    /// Like [`Session::call`], returning the `returnval` child if any
    pub async fn call_returnval(
        &self,
        method: &str,
        this: &MoRef,
        args: &str,
    ) -> Result<Option<Element>, SdkError> {
        let mut resp = self.call(method, this, args).await?;

        Ok(match resp.children.iter().position(|c| c.name == "returnval") {
            Some(i) => Some(resp.children.swap_remove(i)),
            None => None,
        })
    }

    /// Logs out; errors are logged and swallowed. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let logout = self
            .call("Logout", &self.content.session_manager, "")
            .await;
        self.closed.store(true, Ordering::Release);

        match logout {
            Ok(_) => debug!("Logged out of {}", self.url),
            Err(e) => warn!("Logout from {} failed: {e}", self.url),
        }
    }
}

async fn post(
    http: &reqwest::Client,
    url: &Url,
    action: &str,
    body: String,
    bound: Duration,
) -> Result<Element, SdkError> {
    let exchange = async {
        let resp = http
            .post(url.clone())
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", action)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        Ok::<_, SdkError>((status, text))
    };

    let (status, text) = tokio::time::timeout(bound, exchange)
        .await
        .map_err(|_| SdkError::Timeout(bound))??;

    // faults arrive as 500 with an envelope, anything else non 2xx is transport level
    if !status.is_success() && !text.contains("Fault") {
        return Err(SdkError::Transport(format!("{url} answered HTTP {status}")));
    }

    let doc = xml::parse(&text)?;
    soap::response(&doc)
}

/// Opens and closes a session under the test-connect bound
pub async fn test_connect(
    url: &str,
    credentials: &Credentials,
    timeouts: Timeouts,
) -> Result<(), SdkError> {
    let attempt = async {
        let session = Session::open(url, credentials, timeouts).await?;
        session.close().await;
        Ok::<_, SdkError>(())
    };

    tokio::time::timeout(timeouts.test_connect, attempt)
        .await
        .map_err(|_| SdkError::Timeout(timeouts.test_connect))?
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
        net::{TcpListener, TcpStream},
    };

    use super::*;

    const ENVELOPE: &str = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
        xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><soapenv:Body>"#;

    /// A plain HTTP SDK endpoint that drops the session cookie `expire` times
    #[derive(Default)]
    struct Endpoint {
        calls: Mutex<Vec<String>>,
        expire: Mutex<usize>,
    }

    impl Endpoint {
        async fn start(expire: usize) -> (Arc<Self>, String) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}/sdk", listener.local_addr().unwrap());
            let endpoint = Arc::new(Self {
                expire: Mutex::new(expire),
                ..Default::default()
            });

            let serving = endpoint.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let serving = serving.clone();
                    tokio::spawn(async move { serving.connection(stream).await });
                }
            });

            (endpoint, url)
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        async fn connection(&self, stream: TcpStream) -> std::io::Result<()> {
            let mut stream = BufReader::new(stream);
            loop {
                let mut length = 0;
                loop {
                    let mut line = String::new();
                    if stream.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            length = value.trim().parse().unwrap_or(0);
                        }
                    }
                }

                let mut body = vec![0; length];
                stream.read_exact(&mut body).await?;
                let (status, reply) = self.answer(&String::from_utf8_lossy(&body));

                let resp = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{reply}",
                    reply.len()
                );
                stream.get_mut().write_all(resp.as_bytes()).await?;
            }
        }

        fn answer(&self, body: &str) -> (&'static str, String) {
            let method = body
                .find(r#" xmlns="urn:vim25">"#)
                .and_then(|end| body[..end].rfind('<').map(|start| &body[start + 1..end]))
                .unwrap_or_default()
                .to_owned();
            self.calls.lock().push(method.clone());

            let inner = match method.as_str() {
                "RetrieveServiceContent" => r#"<RetrieveServiceContentResponse xmlns="urn:vim25"><returnval>
                    <rootFolder type="Folder">group-d1</rootFolder>
                    <propertyCollector type="PropertyCollector">propertyCollector</propertyCollector>
                    <about><apiVersion>7.0.3</apiVersion><apiType>VirtualCenter</apiType></about>
                    <searchIndex type="SearchIndex">SearchIndex</searchIndex>
                    <sessionManager type="SessionManager">SessionManager</sessionManager>
                    </returnval></RetrieveServiceContentResponse>"#
                    .to_owned(),
                "Login" => r#"<LoginResponse xmlns="urn:vim25"><returnval><key>52a1</key></returnval></LoginResponse>"#
                    .to_owned(),
                m => {
                    let mut expire = self.expire.lock();
                    if *expire > 0 {
                        *expire -= 1;
                        return (
                            "500 Internal Server Error",
                            format!(
                                r#"{ENVELOPE}<soapenv:Fault><faultcode>ServerFaultCode</faultcode>
                                <faultstring>The session is not authenticated.</faultstring>
                                <detail><NotAuthenticatedFault xmlns="urn:vim25" xsi:type="NotAuthenticated"></NotAuthenticatedFault></detail>
                                </soapenv:Fault></soapenv:Body></soapenv:Envelope>"#
                            ),
                        );
                    }
                    format!(r#"<{m}Response xmlns="urn:vim25"><returnval>2026-10-18T00:00:00Z</returnval></{m}Response>"#)
                }
            };

            ("200 OK", format!("{ENVELOPE}{inner}</soapenv:Body></soapenv:Envelope>"))
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            user: "administrator@vsphere.local".into(),
            password: "secret".into(),
            insecure_skip_verify: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn expired_session_logs_in_again() {
        let (endpoint, url) = Endpoint::start(1).await;
        let session = Session::open(&url, &credentials(), Timeouts::default()).await.unwrap();

        let time = session
            .call_returnval("CurrentTime", &MoRef::new("ServiceInstance", "ServiceInstance"), "")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(time.text, "2026-10-18T00:00:00Z");
        assert_eq!(
            endpoint.calls(),
            ["RetrieveServiceContent", "Login", "CurrentTime", "Login", "CurrentTime"]
        );
    }

    #[tokio::test]
    async fn session_logs_in_again_only_once_per_call() {
        let (endpoint, url) = Endpoint::start(2).await;
        let session = Session::open(&url, &credentials(), Timeouts::default()).await.unwrap();

        let err = session
            .call("CurrentTime", &MoRef::new("ServiceInstance", "ServiceInstance"), "")
            .await
            .unwrap_err();

        assert!(matches!(err, SdkError::NotAuthenticated));
        assert_eq!(endpoint.calls().iter().filter(|m| *m == "Login").count(), 2);

        session.close().await;
        assert_eq!(endpoint.calls().last().map(String::as_str), Some("Logout"));
    }

    #[test]
    fn sdk_path_is_appended() {
        assert_eq!(
            sdk_url("https://vcsa.example.com").unwrap().as_str(),
            "https://vcsa.example.com/sdk"
        );
        assert_eq!(
            sdk_url("https://root:pw@10.0.0.5/sdk").unwrap().as_str(),
            "https://10.0.0.5/sdk"
        );
        assert!(sdk_url("not a url").is_err());
    }

    #[test]
    fn service_content_parses() {
        let doc = xml::parse(
            r#"<RetrieveServiceContentResponse xmlns="urn:vim25"><returnval>
                <rootFolder type="Folder">group-d1</rootFolder>
                <propertyCollector type="PropertyCollector">propertyCollector</propertyCollector>
                <about><apiVersion>6.7.3</apiVersion><apiType>VirtualCenter</apiType></about>
                <searchIndex type="SearchIndex">SearchIndex</searchIndex>
                <sessionManager type="SessionManager">SessionManager</sessionManager>
            </returnval></RetrieveServiceContentResponse>"#,
        )
        .unwrap();

        let sc = ServiceContent::from_element(doc.child("returnval").unwrap()).unwrap();
        assert_eq!(sc.root_folder, MoRef::new("Folder", "group-d1"));
        assert!(sc.api_at_least(6, 7));
        assert!(!sc.api_at_least(7, 0));
        assert!(sc.api_at_least(6, 5));
    }
}
