use crate::error::{ProxyError, bad_request, name_unknown};

/// A tenant-scoped repository name: `<org?>/<project>/<repo>`.
///
/// `org` is present only when the client path carries three segments.
/// The cluster segment of permission URIs is a deployment constant and
/// never appears in request paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoName {
    pub org: Option<String>,
    pub project: String,
    pub repo: String,
}

impl RepoName {
    pub fn parse(name: &str) -> Result<Self, ProxyError> {
        let segments: Vec<&str> = name.split('/').collect();
        for segment in &segments {
            validate_segment(segment)?;
        }
        match segments.as_slice() {
            [project, repo] => Ok(Self {
                org: None,
                project: (*project).to_string(),
                repo: (*repo).to_string(),
            }),
            [org, project, repo] => Ok(Self {
                org: Some((*org).to_string()),
                project: (*project).to_string(),
                repo: (*repo).to_string(),
            }),
            _ => Err(name_unknown(format!("repository name does not map: {name}"))),
        }
    }

    pub fn as_tenant(&self) -> String {
        match &self.org {
            Some(org) => format!("{org}/{}/{}", self.project, self.repo),
            None => format!("{}/{}", self.project, self.repo),
        }
    }

    pub fn permission_uri(&self, cluster: &str) -> String {
        format!("image://{cluster}/{}", self.as_tenant())
    }
}

fn validate_segment(segment: &str) -> Result<(), ProxyError> {
    if segment.is_empty() {
        return Err(bad_request("empty repository path segment"));
    }
    if segment.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(bad_request(format!(
            "repository names must be lowercase: {segment}"
        )));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
    {
        return Err(bad_request(format!(
            "invalid repository path segment: {segment}"
        )));
    }
    Ok(())
}

/// Pure tenant ↔ upstream name and URL mapping. The upstream prefix is
/// the configured project for token-service upstreams and empty for
/// basic / aws_ecr ones.
#[derive(Debug, Clone)]
pub struct Rewriter {
    prefix: Vec<String>,
}

impl Rewriter {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix
                .split('/')
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        }
    }

    pub fn to_upstream(&self, tenant_name: &str) -> String {
        if self.prefix.is_empty() {
            return tenant_name.to_string();
        }
        format!("{}/{tenant_name}", self.prefix.join("/"))
    }

    /// Inverse of [`to_upstream`]: strips the prefix, rejecting names
    /// outside it.
    pub fn to_tenant(&self, upstream_name: &str) -> Option<String> {
        let mut segments = upstream_name.split('/');
        for expected in &self.prefix {
            if segments.next()? != expected {
                return None;
            }
        }
        let rest: Vec<&str> = segments.collect();
        if rest.is_empty() || rest.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(rest.join("/"))
    }

    /// Rewrites an upstream `Location` value (absolute or relative) into
    /// an origin-relative URL under the proxy's `/v2/` namespace, with
    /// the upstream prefix stripped from the repository path. The query
    /// string (upload session state, digests) passes through verbatim.
    pub fn rewrite_location(&self, raw: &str) -> Option<String> {
        let rest = strip_authority(raw);
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.first() == Some(&"v2") {
            segments.remove(0);
        }
        if segments.len() >= self.prefix.len()
            && self
                .prefix
                .iter()
                .zip(&segments)
                .all(|(expected, got)| expected == got)
        {
            segments.drain(..self.prefix.len());
        }
        if segments.is_empty() {
            return None;
        }

        let mut rewritten = format!("/v2/{}", segments.join("/"));
        if let Some(query) = query {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        Some(rewritten)
    }

    /// Rewrites the URL inside a `Link: <…>; rel="next"` header value,
    /// leaving the parameters untouched.
    pub fn rewrite_link(&self, raw: &str) -> Option<String> {
        let start = raw.find('<')?;
        let end = raw.find('>')?;
        let url = raw.get(start + 1..end)?;
        let rewritten = self.rewrite_location(url)?;
        Some(format!("<{rewritten}>{}", raw.get(end + 1..)?))
    }
}

/// Extracts the target of a `rel="next"` link from an upstream `Link`
/// header, for catalog pagination.
pub fn next_link_target(header: &str) -> Option<String> {
    for part in header.split(',') {
        let part = part.trim();
        let start = part.find('<')?;
        let end = part.find('>')?;
        let params = part.get(end + 1..)?;
        if params.replace(' ', "").contains("rel=\"next\"") {
            return part.get(start + 1..end).map(ToOwned::to_owned);
        }
    }
    None
}

fn strip_authority(raw: &str) -> &str {
    let rest = if let Some(idx) = raw.find("://") {
        &raw[idx + 3..]
    } else if let Some(stripped) = raw.strip_prefix("//") {
        stripped
    } else {
        return raw;
    };
    match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "/",
    }
}
