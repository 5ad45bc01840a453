//! The service provider: access filter, authentication initiator and artifact consumer.

mod client;
mod initiator;
mod resolver;

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header::LOCATION, StatusCode, Uri},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Extension, Form, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use time::OffsetDateTime;

pub use client::{ArtifactResolutionClient, HttpSoapClient};
pub use initiator::{initiate, RedirectInstruction};
pub use resolver::{
    build_artifact_from_request, build_artifact_resolve, resolve, sign_artifact_resolve,
    verify_and_decrypt, ArtifactResponseEnvelope, ResolutionExpectations,
};

use crate::{
    config::SpConfig,
    credentials::CredentialStore,
    session::{establish, Principal, SessionStore},
    signature::Signable,
    utils::html_escape,
    SamlError,
};

pub const SESSION_COOKIE: &str = "SAMLSESSION";

pub struct ServiceProvider {
    config: SpConfig,
    credentials: CredentialStore,
    sessions: SessionStore,
    client: Arc<dyn ArtifactResolutionClient>,
}

impl ServiceProvider {
    pub fn new(
        config: SpConfig,
        credentials: CredentialStore,
        client: Arc<dyn ArtifactResolutionClient>,
    ) -> Self {
        let sessions = SessionStore::new(config.session_idle);
        ServiceProvider {
            config,
            credentials,
            sessions,
            client,
        }
    }

    pub fn config(&self) -> &SpConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Resolves `artifact` for the session `session_id` and establishes it.
    ///
    /// Returns the URL the user originally asked for. The session is only
    /// marked authenticated once every check on the assertion passed.
    pub async fn consume(
        &self,
        session_id: &str,
        artifact: Option<&str>,
    ) -> Result<String, SamlError> {
        let artifact = build_artifact_from_request(artifact)?;
        let authn_request_id = self
            .sessions
            .get(session_id)
            .ok_or(SamlError::UnknownSession)?
            .authn_request_id()
            .map(str::to_string)
            .ok_or_else(|| SamlError::Correlation("no pending AuthnRequest".into()))?;

        let artifact_resolve = build_artifact_resolve(&self.config, &artifact)?;
        let artifact_resolve_id = artifact_resolve.id().to_string();
        let signed = sign_artifact_resolve(artifact_resolve, &self.credentials)?;

        let envelope = resolve(
            self.client.as_ref(),
            &self.config.idp_artifact_resolution_url,
            &signed,
            self.config.resolve_timeout,
        )
        .await?;

        let info = verify_and_decrypt(
            &envelope,
            &ResolutionExpectations {
                config: &self.config,
                credentials: &self.credentials,
                artifact_resolve_id: &artifact_resolve_id,
                authn_request_id: &authn_request_id,
                now: OffsetDateTime::now_utc(),
            },
        )?;

        let principal = Principal {
            name_id: info.name_id,
            session_index: info.session_index,
            attributes: info.attributes,
        };
        let goto_url = self.sessions.update(session_id, |session| {
            establish(session, &authn_request_id, principal)
        })??;
        tracing::info!(goto_url = %goto_url, "redirecting to requested URL");
        Ok(goto_url)
    }
}

/// Consumer endpoints and the demo resource under `/app`.
pub fn router(sp: Arc<ServiceProvider>) -> Router {
    let protected = Router::new()
        .route("/app", get(protected_resource))
        .route("/app/*path", get(protected_resource));

    Router::new()
        .route("/sp/consumer", get(consumer_get).post(consumer_post))
        .with_state(sp.clone())
        .merge(protect(protected, sp))
}

/// Puts `router` behind the access filter.
pub fn protect(router: Router, sp: Arc<ServiceProvider>) -> Router {
    router.layer(middleware::from_fn_with_state(sp, access_filter))
}

fn session_cookie(id: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, id))
        .path("/")
        .http_only(true)
        .build()
}

/// Lets authenticated sessions through and sends everyone else to the IDP.
pub async fn access_filter(
    State(sp): State<Arc<ServiceProvider>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let existing = jar
        .get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .and_then(|id| sp.sessions.get(&id).map(|session| (id, session)));

    if let Some((_, session)) = &existing {
        if session.is_authenticated() {
            if let Some(principal) = session.principal() {
                request.extensions_mut().insert(principal.clone());
            }
            return next.run(request).await;
        }
    }

    let (session_id, jar) = match existing {
        Some((id, _)) => (id, jar),
        None => {
            let id = sp.sessions.create();
            (id.clone(), jar.add(session_cookie(id)))
        }
    };

    let requested_url = format!(
        "{}{}",
        sp.config.base_url,
        request
            .uri()
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/")
    );
    tracing::info!(url = %requested_url, "unauthenticated access, starting SSO");

    match sp
        .sessions
        .update(&session_id, |session| initiate(&sp.config, session, &requested_url))
    {
        Ok(Ok(instruction)) => (jar, instruction).into_response(),
        Ok(Err(error)) | Err(error) => error.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ConsumerParams {
    #[serde(rename = "SAMLart")]
    pub saml_art: Option<String>,
}

async fn consumer_get(
    State(sp): State<Arc<ServiceProvider>>,
    jar: CookieJar,
    Query(params): Query<ConsumerParams>,
) -> Result<Response, SamlError> {
    handle_consumer(&sp, &jar, params).await
}

async fn consumer_post(
    State(sp): State<Arc<ServiceProvider>>,
    jar: CookieJar,
    Form(params): Form<ConsumerParams>,
) -> Result<Response, SamlError> {
    handle_consumer(&sp, &jar, params).await
}

async fn handle_consumer(
    sp: &ServiceProvider,
    jar: &CookieJar,
    params: ConsumerParams,
) -> Result<Response, SamlError> {
    let session_id = jar
        .get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .ok_or(SamlError::UnknownSession)?;
    let goto_url = sp.consume(&session_id, params.saml_art.as_deref()).await?;
    Ok((StatusCode::FOUND, [(LOCATION, goto_url)]).into_response())
}

async fn protected_resource(Extension(principal): Extension<Principal>, uri: Uri) -> Html<String> {
    let attributes: String = principal
        .attributes
        .iter()
        .map(|(name, values)| {
            format!(
                "<li>{}: {}</li>",
                html_escape(name),
                html_escape(&values.join(", "))
            )
        })
        .collect();
    Html(format!(
        "<html><head></head><body><h1>{}</h1><p>Authenticated as {}</p><ul>{attributes}</ul></body></html>",
        html_escape(uri.path()),
        html_escape(&principal.name_id),
    ))
}
