use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use shaml_artifact::{
    config::{IdpConfig, SpConfig},
    idp::{self, IdentityProvider},
    sp::{self, ArtifactResolutionClient, ServiceProvider},
    Artifact, AuthnRequestInfo, Credential, CredentialStore, PendingResponse, SamlError,
};
use tower::ServiceExt;

const SP_KEY: &str = include_str!("../static/keys/sp.key.pem");
const SP_PUB: &str = include_str!("../static/keys/sp.pub.pem");
const IDP_KEY: &str = include_str!("../static/keys/idp.key.pem");
const IDP_PUB: &str = include_str!("../static/keys/idp.pub.pem");
const ROGUE_KEY: &str = include_str!("../static/keys/rogue.key.pem");

const IDP_SSO_URL: &str = "http://localhost:9090/idp/sso";
const ARTIFACT_RESOLUTION_URL: &str = "http://localhost:9090/idp/artifactResolutionService";
const CONSUMER_URL: &str = "http://localhost:8080/sp/consumer";

fn environment() -> HashMap<&'static str, &'static str> {
    [
        ("SP_ENTITY_ID", "TestSP"),
        ("SP_BASE_URL", "http://localhost:8080"),
        ("SP_CONSUMER_URL", CONSUMER_URL),
        ("IDP_ENTITY_ID", "TestIDP"),
        ("IDP_SSO_URL", IDP_SSO_URL),
        ("IDP_ARTIFACT_RESOLUTION_URL", ARTIFACT_RESOLUTION_URL),
        ("SP_PRIVATE_KEY", "unused"),
        ("SP_PUBLIC_KEY", "unused"),
        ("IDP_PRIVATE_KEY", "unused"),
        ("IDP_PUBLIC_KEY", "unused"),
        ("SAML_CLOCK_SKEW_SECS", "60"),
        ("SP_RESOLVE_TIMEOUT_SECS", "5"),
        ("IDP_ASSERTION_LIFETIME_SECS", "300"),
        ("IDP_ARTIFACT_TTL_SECS", "60"),
    ]
    .into_iter()
    .collect()
}

/// Back channel wired straight into the IDP object.
struct InProcessIdp(Arc<IdentityProvider>);

#[async_trait]
impl ArtifactResolutionClient for InProcessIdp {
    async fn send(&self, endpoint: &str, envelope: String) -> Result<String, SamlError> {
        assert_eq!(endpoint, ARTIFACT_RESOLUTION_URL);
        self.0.resolve_artifact(&envelope)
    }
}

struct Parties {
    sp: Arc<ServiceProvider>,
    idp: Arc<IdentityProvider>,
    sp_app: Router,
    idp_app: Router,
}

fn parties(idp_signing_key: &str) -> Parties {
    let vars = environment();
    let lookup = |key: &str| vars.get(key).map(|value| value.to_string());

    let idp_credentials = CredentialStore::new(
        Credential::from_private_pem("TestIDP", idp_signing_key).unwrap(),
        Credential::from_public_pem("TestSP", SP_PUB).unwrap(),
    )
    .unwrap();
    let idp = Arc::new(IdentityProvider::new(
        IdpConfig::from_lookup(lookup).unwrap(),
        idp_credentials,
    ));

    let sp_credentials = CredentialStore::new(
        Credential::from_private_pem("TestSP", SP_KEY).unwrap(),
        Credential::from_public_pem("TestIDP", IDP_PUB).unwrap(),
    )
    .unwrap();
    let sp = Arc::new(ServiceProvider::new(
        SpConfig::from_lookup(lookup).unwrap(),
        sp_credentials,
        Arc::new(InProcessIdp(idp.clone())),
    ));

    Parties {
        sp_app: sp::router(sp.clone()),
        idp_app: idp::router(idp.clone()),
        sp,
        idp,
    }
}

async fn call(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut request = Request::get(uri);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    request.body(Body::empty()).unwrap()
}

fn post_form(uri: &str, field: &str, value: &str, cookie: Option<&str>) -> Request<Body> {
    let mut request = Request::post(uri).header(
        header::CONTENT_TYPE,
        "application/x-www-form-urlencoded",
    );
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    request
        .body(Body::from(format!("{field}={}", urlencoding::encode(value))))
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn location(response: &Response) -> String {
    response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string()
}

/// `SAMLSESSION=<id>` as sent back in a `Cookie` header.
fn session_cookie(response: &Response) -> String {
    response.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

fn session_id(cookie: &str) -> &str {
    cookie.strip_prefix("SAMLSESSION=").unwrap()
}

fn hidden_field(html: &str, name: &str) -> String {
    let marker = format!(r#"name="{name}" value=""#);
    let start = html.find(&marker).unwrap() + marker.len();
    html[start..start + html[start..].find('"').unwrap()].to_string()
}

/// Runs the browser up to the point where it holds an artifact.
async fn authenticate_at_idp(parties: &Parties, protected: &str) -> (String, String) {
    let response = call(&parties.sp_app, get(protected, None)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let cookie = session_cookie(&response);
    let location = location(&response);
    let query = location.strip_prefix(IDP_SSO_URL).unwrap();

    let login = call(&parties.idp_app, get(&format!("/idp/sso{query}"), None)).await;
    assert_eq!(login.status(), StatusCode::OK);
    let saml_request = hidden_field(&body_text(login).await, "SAMLRequest");

    let issued = call(
        &parties.idp_app,
        post_form("/idp/sso", "SAMLRequest", &saml_request, None),
    )
    .await;
    assert_eq!(issued.status(), StatusCode::OK);
    let html = body_text(issued).await;
    assert!(html.contains(&format!(r#"action="{CONSUMER_URL}""#)));
    (cookie, hidden_field(&html, "SAMLart"))
}

#[tokio::test]
async fn redirect_carries_configured_endpoints() {
    let parties = parties(IDP_KEY);
    let response = call(&parties.sp_app, get("/app", None)).await;
    assert_eq!(response.status(), StatusCode::FOUND);

    let location = location(&response);
    let (base, query) = location.split_once('?').unwrap();
    assert_eq!(base, IDP_SSO_URL);
    let encoded = query.strip_prefix("SAMLRequest=").unwrap();
    let request = AuthnRequestInfo::decode(&urlencoding::decode(encoded).unwrap()).unwrap();
    assert_eq!(request.destination.as_deref(), Some(IDP_SSO_URL));
    assert_eq!(request.assertion_consumer_service_url.as_deref(), Some(CONSUMER_URL));
    assert_eq!(request.issuer, "TestSP");
}

#[tokio::test]
async fn artifact_flow_authenticates_session() {
    let parties = parties(IDP_KEY);
    let (cookie, artifact) = authenticate_at_idp(&parties, "/app/reports?year=2024").await;

    let consumed = call(
        &parties.sp_app,
        post_form("/sp/consumer", "SAMLart", &artifact, Some(&cookie)),
    )
    .await;
    assert_eq!(consumed.status(), StatusCode::FOUND);
    assert_eq!(
        location(&consumed),
        "http://localhost:8080/app/reports?year=2024"
    );

    let session = parties.sp.sessions().get(session_id(&cookie)).unwrap();
    assert!(session.is_authenticated());
    let principal = session.principal().unwrap();
    assert!(principal
        .attributes
        .contains(&("username".to_string(), vec!["bob".to_string()])));

    let page = call(&parties.sp_app, get("/app/reports?year=2024", Some(&cookie))).await;
    assert_eq!(page.status(), StatusCode::OK);
    assert!(body_text(page).await.contains(&principal.name_id));
}

#[tokio::test]
async fn literal_artifact_is_resolved_over_back_channel() {
    let parties = parties(IDP_KEY);
    let response = call(&parties.sp_app, get("/app", None)).await;
    let cookie = session_cookie(&response);
    let redirect = location(&response);
    let encoded = urlencoding::decode(redirect.split_once("SAMLRequest=").unwrap().1).unwrap();

    let request = parties.idp.accept_authn_request(&encoded).unwrap();
    let pending = parties.idp.build_response(&request).unwrap();
    parties.idp.artifacts().insert(
        &Artifact::from_value(Some("ART123")).unwrap(),
        PendingResponse::new("TestSP", pending),
    );

    let consumed = call(
        &parties.sp_app,
        get("/sp/consumer?SAMLart=ART123", Some(&cookie)),
    )
    .await;
    assert_eq!(consumed.status(), StatusCode::FOUND);
    assert_eq!(location(&consumed), "http://localhost:8080/app");
    assert!(parties
        .sp
        .sessions()
        .get(session_id(&cookie))
        .unwrap()
        .is_authenticated());
}

#[tokio::test]
async fn artifact_cannot_be_replayed() {
    let parties = parties(IDP_KEY);
    let (cookie, artifact) = authenticate_at_idp(&parties, "/app").await;

    let first = call(
        &parties.sp_app,
        get(
            &format!("/sp/consumer?SAMLart={}", urlencoding::encode(&artifact)),
            Some(&cookie),
        ),
    )
    .await;
    assert_eq!(first.status(), StatusCode::FOUND);

    // A second browser replays the same artifact.
    let (other_cookie, _) = authenticate_at_idp(&parties, "/app").await;
    let replay = call(
        &parties.sp_app,
        post_form("/sp/consumer", "SAMLart", &artifact, Some(&other_cookie)),
    )
    .await;
    assert!(replay.status().is_server_error());
    assert!(!parties
        .sp
        .sessions()
        .get(session_id(&other_cookie))
        .unwrap()
        .is_authenticated());
}

#[tokio::test]
async fn second_artifact_cannot_take_over_authenticated_session() {
    let parties = parties(IDP_KEY);
    let (cookie, artifact) = authenticate_at_idp(&parties, "/app").await;
    let consumed = call(
        &parties.sp_app,
        post_form("/sp/consumer", "SAMLart", &artifact, Some(&cookie)),
    )
    .await;
    assert_eq!(consumed.status(), StatusCode::FOUND);
    let before = parties.sp.sessions().get(session_id(&cookie)).unwrap();

    let (_, other_artifact) = authenticate_at_idp(&parties, "/app/admin").await;
    let takeover = call(
        &parties.sp_app,
        post_form("/sp/consumer", "SAMLart", &other_artifact, Some(&cookie)),
    )
    .await;
    assert!(takeover.status().is_server_error());

    let after = parties.sp.sessions().get(session_id(&cookie)).unwrap();
    assert!(after.is_authenticated());
    assert_eq!(
        after.principal().unwrap().name_id,
        before.principal().unwrap().name_id
    );
}

#[tokio::test]
async fn artifact_from_another_login_is_rejected() {
    let parties = parties(IDP_KEY);
    let (cookie, artifact) = authenticate_at_idp(&parties, "/app/mine").await;
    let (_, other_artifact) = authenticate_at_idp(&parties, "/app/theirs").await;

    let crossed = call(
        &parties.sp_app,
        post_form("/sp/consumer", "SAMLart", &other_artifact, Some(&cookie)),
    )
    .await;
    assert!(crossed.status().is_server_error());
    assert!(!parties
        .sp
        .sessions()
        .get(session_id(&cookie))
        .unwrap()
        .is_authenticated());

    let own = call(
        &parties.sp_app,
        post_form("/sp/consumer", "SAMLart", &artifact, Some(&cookie)),
    )
    .await;
    assert_eq!(own.status(), StatusCode::FOUND);
    assert_eq!(location(&own), "http://localhost:8080/app/mine");
}

#[tokio::test]
async fn assertion_signed_by_untrusted_key_is_rejected() {
    let parties = parties(ROGUE_KEY);
    let (cookie, artifact) = authenticate_at_idp(&parties, "/app").await;

    let consumed = call(
        &parties.sp_app,
        post_form("/sp/consumer", "SAMLart", &artifact, Some(&cookie)),
    )
    .await;
    assert_eq!(consumed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_text(consumed).await,
        "authentication could not be verified"
    );

    let session = parties.sp.sessions().get(session_id(&cookie)).unwrap();
    assert!(!session.is_authenticated());

    let page = call(&parties.sp_app, get("/app", Some(&cookie))).await;
    assert_eq!(page.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn consumer_requires_a_session() {
    let parties = parties(IDP_KEY);
    let response = call(&parties.sp_app, get("/sp/consumer?SAMLart=ART123", None)).await;
    assert!(response.status().is_server_error());
}

#[tokio::test]
async fn idp_rejects_missing_saml_request() {
    let parties = parties(IDP_KEY);
    let response = call(&parties.idp_app, get("/idp/sso", None)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
