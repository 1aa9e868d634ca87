use std::io::Cursor;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, trace, warn};
use moka::{Expiry, future::Cache};
use oci_spec::{
    OciSpecError,
    distribution::Reference,
    image::{Descriptor, Digest, DigestAlgorithm, ImageIndex},
};
use reqwest::{Method, Response, StatusCode, header, header::HeaderValue};
use serde::Deserialize;
use sha2::Sha256;

use crate::auth::Credential;

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";

// referrer manifests can be image manifests, indexes, or (older pushes)
// artifact manifests
const ACCEPTED_MANIFESTS: &str = "application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.artifact.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Reqwest(#[from] reqwest::Error),
    OciSpec(#[from] OciSpecError),
    DigestMismatch,
    SizeMismatch,
    NoTagOrDigest,
    BadDigest,
    BadDockerContentDigest,
    ManifestNotFound,
    BlobNotFound,
    TokenExchange,
    DigestAlgorithmNotHandled(DigestAlgorithm),
    StatusNotOk(StatusCode),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<String, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(value.expires_in)
    }
}

/// Registry protocol driver bound to a single repository. Pull-only: it
/// resolves manifests, walks the Referrers API, and fetches manifest and
/// blob payloads, exchanging bearer tokens on demand.
pub struct RepositoryClient {
    http: reqwest::Client,
    scheme: &'static str,
    registry: String,
    repository: String,
    scope: String,
    credential: Credential,
    tokens: Cache<String, Token>,
}

impl RepositoryClient {
    pub fn new(
        reference: &Reference,
        credential: Credential,
        http: reqwest::Client,
        plain_http: bool,
    ) -> Self {
        let registry = reference.resolve_registry().to_string();
        let repository = reference.repository().to_string();
        let scope = format!("repository:{}:pull", repository);
        let tokens = Cache::builder()
            .max_capacity(8)
            .expire_after(ExpireToken)
            .build();
        RepositoryClient {
            http,
            scheme: if plain_http { "http" } else { "https" },
            registry,
            repository,
            scope,
            credential,
            tokens,
        }
    }

    /// Resolves a tag or digest reference to the subject descriptor. This
    /// is authoritative for the subject digest of a mutable tag.
    pub async fn resolve(&self, reference: &Reference) -> Result<Descriptor, Error> {
        let expected: Option<Digest> = reference
            .digest()
            .map(|s| s.parse().map_err(|_| Error::BadDigest))
            .transpose()?;
        // a ref carrying both a tag and a digest resolves by digest
        let target = reference
            .digest()
            .or_else(|| reference.tag())
            .ok_or(Error::NoTagOrDigest)?;
        self.resolve_target(target, expected.as_ref())
            .await?
            .ok_or(Error::ManifestNotFound)
    }

    /// Resolves a manifest by tag or digest string, `None` when the
    /// registry has no such manifest. The descriptor digest is always
    /// verified against the body.
    pub async fn resolve_target(
        &self,
        target: &str,
        expected: Option<&Digest>,
    ) -> Result<Option<Descriptor>, Error> {
        let url = self.url(&format!("manifests/{}", target));
        trace!("GET {url}");
        let request = self
            .http
            .request(Method::GET, &url)
            .header(header::ACCEPT, ACCEPTED_MANIFESTS);
        let response = self.auth_and_retry(request).await?;
        match response.status() {
            StatusCode::OK => {
                let header_digest = docker_content_digest(&response)?;
                let content_type = content_type(&response);
                let data = response.bytes().await?;
                let digest = match expected {
                    Some(d) => d.clone(),
                    None => header_digest.unwrap_or_else(|| digest_from_data(&data)),
                };
                verify_data(&digest, &data)?;
                Ok(Some(Descriptor::new(
                    content_type.as_str().into(),
                    data.len() as u64,
                    digest,
                )))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_not_ok(response).await),
        }
    }

    /// Walks every page of the Referrers API for `subject` and returns the
    /// concatenated descriptor list in registry order. A registry without
    /// the referrers route answers 404, which is an empty result here, not
    /// an error.
    pub async fn list_referrers(
        &self,
        subject: &Digest,
        artifact_type: Option<&str>,
    ) -> Result<Vec<Descriptor>, Error> {
        let mut referrers = Vec::new();
        let url = self.url(&format!("referrers/{}", subject));
        trace!("GET {url}");
        let mut request = self.http.request(Method::GET, &url);
        if let Some(artifact_type) = artifact_type {
            request = request.query(&[("artifactType", artifact_type)]);
        }
        loop {
            let response = self.auth_and_retry(request).await?;
            match response.status() {
                StatusCode::OK => {}
                StatusCode::NOT_FOUND => return Ok(referrers),
                _ => return Err(status_not_ok(response).await),
            }
            let next = response
                .headers()
                .get(header::LINK)
                .and_then(parse_link_next_header)
                .map(|uri| self.absolute_url(&uri));
            let data = response.bytes().await?;
            let index = ImageIndex::from_reader(Cursor::new(&data))?;
            referrers.extend(index.manifests().iter().cloned());
            match next {
                Some(url) => {
                    trace!("GET {url} (next referrers page)");
                    request = self.http.request(Method::GET, &url);
                }
                None => return Ok(referrers),
            }
        }
    }

    /// Fetches a referrer manifest by descriptor, verifying size and
    /// digest against the body.
    pub async fn fetch_manifest(&self, descriptor: &Descriptor) -> Result<Bytes, Error> {
        let url = self.url(&format!("manifests/{}", descriptor.digest()));
        trace!("GET {url}");
        let request = self
            .http
            .request(Method::GET, &url)
            .header(header::ACCEPT, ACCEPTED_MANIFESTS);
        let response = self.auth_and_retry(request).await?;
        match response.status() {
            StatusCode::OK => {
                let data = response.bytes().await?;
                if data.len() as u64 != descriptor.size() {
                    return Err(Error::SizeMismatch);
                }
                verify_data(descriptor.digest(), &data)?;
                Ok(data)
            }
            StatusCode::NOT_FOUND => Err(Error::ManifestNotFound),
            _ => Err(status_not_ok(response).await),
        }
    }

    /// Fetches a blob by digest. The size is unknown up front, so only the
    /// digest is verified; callers learn the real size from the bytes.
    pub async fn fetch_blob(&self, digest: &Digest) -> Result<Bytes, Error> {
        let url = self.url(&format!("blobs/{}", digest));
        trace!("GET {url}");
        let request = self.http.request(Method::GET, &url);
        let response = self.auth_and_retry(request).await?;
        match response.status() {
            StatusCode::OK => {
                let data = response.bytes().await?;
                verify_data(digest, &data)?;
                Ok(data)
            }
            StatusCode::NOT_FOUND => Err(Error::BlobNotFound),
            _ => Err(status_not_ok(response).await),
        }
    }

    fn url(&self, rest: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}",
            self.scheme, self.registry, self.repository, rest
        )
    }

    fn absolute_url(&self, uri: &str) -> String {
        if uri.starts_with('/') {
            format!("{}://{}{}", self.scheme, self.registry, uri)
        } else {
            uri.to_string()
        }
    }

    // Send with the cached token if any. On 401, look at WWW-Authenticate:
    // a Basic challenge is answered straight from the credential, a Bearer
    // challenge goes through token exchange against the advertised realm,
    // then the request is retried once. Anything still not OK is the
    // caller's error to surface.
    async fn auth_and_retry(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Response, Error> {
        // safe because every request this client sends is a bodyless GET
        let retry = request.try_clone().unwrap();

        let request = if let Some(token) = self.tokens.get(&self.scope).await {
            request.bearer_auth(token.token)
        } else {
            request
        };
        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge_header) = response.headers().get(header::WWW_AUTHENTICATE) else {
            return Ok(response);
        };
        if challenge_header.as_bytes().starts_with(b"Basic") {
            if let (Some(user), Some(pass)) = (&self.credential.username, &self.credential.password)
            {
                return Ok(retry.basic_auth(user, Some(pass)).send().await?);
            }
            return Ok(response);
        }
        let Some(challenge) = parse_bearer_challenge_header(challenge_header) else {
            warn!(
                "401 from {} with unusable www-authenticate header {:?}",
                self.registry, challenge_header
            );
            return Ok(response);
        };
        let token = self.exchange_token(&challenge).await?;
        Ok(retry.bearer_auth(token.token).send().await?)
    }

    async fn exchange_token(&self, challenge: &BearerChallenge<'_>) -> Result<Token, Error> {
        let scope = challenge.scope.unwrap_or(&self.scope);
        let entry = self
            .tokens
            .entry(self.scope.clone())
            .or_try_insert_with(fetch_token(
                self.http.clone(),
                challenge.realm,
                challenge.service,
                scope,
                &self.credential,
            ))
            .await
            .map_err(|e| {
                error!("token exchange for {} failed: {:?}", self.repository, e);
                Error::TokenExchange
            })?;
        if entry.is_fresh() {
            trace!("new token for {}", entry.key());
        }
        Ok(entry.into_value())
    }
}

async fn fetch_token(
    client: reqwest::Client,
    realm: &str,
    service: &str,
    scope: &str,
    credential: &Credential,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct TokenResponse {
        token: Option<String>,
        access_token: Option<String>,
        expires_in: Option<u64>,
    }

    let request = client
        .request(Method::GET, realm)
        .query(&[("service", service), ("scope", scope)]);
    let request = match (&credential.username, credential.secret()) {
        (Some(user), Some(secret)) => request.basic_auth(user, Some(secret)),
        // identity-token-only credentials use the docker token-user convention
        (None, Some(secret)) => request.basic_auth("<token>", Some(secret)),
        _ => request,
    };
    let response = request.send().await?;
    if response.status() != StatusCode::OK {
        return Err(status_not_ok(response).await);
    }
    let body: TokenResponse = response.json().await?;
    let token = body.token.or(body.access_token).ok_or(Error::TokenExchange)?;
    // https://distribution.github.io/distribution/spec/auth/token/#token-response-fields
    // gives the default as 60 seconds
    let expires_in = Duration::from_secs(body.expires_in.unwrap_or(60));
    Ok(Token { token, expires_in })
}

async fn status_not_ok(response: Response) -> Error {
    let status = response.status();
    if log::log_enabled!(log::Level::Debug) {
        match response.text().await {
            Ok(body) => debug!("status={status} body={body}"),
            Err(e) => debug!("status={status}, error reading body {e:?}"),
        }
    }
    Error::StatusNotOk(status)
}

fn content_type(response: &Response) -> String {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap_or("").to_string())
        .unwrap_or_default()
}

fn docker_content_digest(response: &Response) -> Result<Option<Digest>, Error> {
    response
        .headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .map(|v| -> Result<Digest, Error> {
            v.to_str()
                .map_err(|_| Error::BadDockerContentDigest)?
                .parse()
                .map_err(|_| Error::BadDockerContentDigest)
        })
        .transpose()
}

pub(crate) fn digest_from_data(data: impl AsRef<[u8]>) -> Digest {
    use sha2::Digest as _;
    use std::str::FromStr;
    oci_spec::image::Sha256Digest::from_str(&hex::encode(Sha256::digest(data)))
        .unwrap()
        .into()
}

fn verify_data(expected: &Digest, data: &[u8]) -> Result<(), Error> {
    match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            use sha2::Digest as _;
            if hex::encode(Sha256::digest(data)) == expected.digest() {
                Ok(())
            } else {
                Err(Error::DigestMismatch)
            }
        }
        algo => {
            error!("digest algorithm not handled {}", algo);
            Err(Error::DigestAlgorithmNotHandled(algo.clone()))
        }
    }
}

struct BearerChallenge<'a> {
    realm: &'a str,
    service: &'a str,
    scope: Option<&'a str>,
}

fn parse_bearer_challenge_header(input: &HeaderValue) -> Option<BearerChallenge<'_>> {
    parse_bearer_challenge_str(input.to_str().ok()?)
}

fn parse_bearer_challenge_str(input: &str) -> Option<BearerChallenge<'_>> {
    use nom::{
        IResult, Parser,
        bytes::complete::{tag, take_until1},
        character::complete::{alpha1, char, multispace0},
        multi::{many1, separated_list0},
        sequence::{delimited, preceded, separated_pair},
    };
    fn params(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        preceded(
            (tag("Bearer"), many1(char(' '))),
            separated_list0(
                (char(','), multispace0),
                separated_pair(
                    alpha1,
                    char('='),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)
    }
    let (_, pairs) = params(input).ok()?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for (k, v) in pairs {
        match k {
            "realm" => realm = Some(v),
            "service" => service = Some(v),
            "scope" => scope = Some(v),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service: service?,
        scope,
    })
}

fn parse_link_next_header(input: &HeaderValue) -> Option<String> {
    parse_link_next_str(input.to_str().ok()?).map(str::to_string)
}

// RFC 8288 link header, reduced to what registries send for pagination:
// comma-separated `<uri>; rel="next"` values
fn parse_link_next_str(input: &str) -> Option<&str> {
    use nom::{
        IResult, Parser,
        bytes::complete::{tag, take_until1, take_while},
        character::complete::{char, multispace0},
        multi::separated_list1,
        sequence::{delimited, preceded},
    };
    fn link(input: &str) -> IResult<&str, (&str, &str)> {
        let (input, uri) = delimited(char('<'), take_until1(">"), char('>')).parse(input)?;
        let (input, params) = take_while(|c| c != ',').parse(input)?;
        Ok((input, (uri, params)))
    }
    let (_, links) = separated_list1(tag(","), preceded(multispace0, link))
        .parse(input)
        .ok()?;
    links
        .into_iter()
        .find(|(_, params)| params.contains(r#"rel="next""#))
        .map(|(uri, _)| uri)
}
