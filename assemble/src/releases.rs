use crate::config::{OrganizationConfig, TokenConfig};
use crate::types::{OrganizationId, ProjectId};
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, PartialEq)]
pub struct Organization {
    pub id: OrganizationId,
    pub slug: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Release {
    pub organization_id: OrganizationId,
    pub version: String,
    pub project_ids: Vec<ProjectId>,
}

pub trait ReleaseStore: Send + Sync {
    /// Resolves an organization by its numeric id or its slug.
    fn organization(&self, id_or_slug: &str) -> Option<Organization>;

    fn release(&self, organization_id: OrganizationId, version: &str) -> Option<Release>;
}

struct OrganizationEntry {
    organization: Organization,
    releases: HashMap<String, Release>,
}

/// Release store backed by a fixed set of organizations and releases.
pub struct StaticReleaseStore {
    organizations: HashMap<OrganizationId, OrganizationEntry>,
    slug_to_id: HashMap<String, OrganizationId>,
}

impl StaticReleaseStore {
    pub fn new(organizations: &[OrganizationConfig]) -> Self {
        let mut store = StaticReleaseStore {
            organizations: HashMap::new(),
            slug_to_id: HashMap::new(),
        };

        for org in organizations {
            let releases = org
                .releases
                .iter()
                .map(|r| {
                    let release = Release {
                        organization_id: org.id,
                        version: r.version.clone(),
                        project_ids: r.projects.clone(),
                    };
                    (r.version.clone(), release)
                })
                .collect();

            store.slug_to_id.insert(org.slug.clone(), org.id);
            store.organizations.insert(
                org.id,
                OrganizationEntry {
                    organization: Organization {
                        id: org.id,
                        slug: org.slug.clone(),
                    },
                    releases,
                },
            );
        }

        store
    }
}

impl ReleaseStore for StaticReleaseStore {
    fn organization(&self, id_or_slug: &str) -> Option<Organization> {
        let id = match self.slug_to_id.get(id_or_slug) {
            Some(id) => *id,
            None => id_or_slug.parse().ok()?,
        };
        self.organizations
            .get(&id)
            .map(|entry| entry.organization.clone())
    }

    fn release(&self, organization_id: OrganizationId, version: &str) -> Option<Release> {
        self.organizations
            .get(&organization_id)?
            .releases
            .get(version)
            .cloned()
    }
}

/// The authenticated caller of an API request.
#[derive(Clone, Debug, PartialEq)]
pub struct Caller {
    pub organization_id: OrganizationId,
    /// `None` grants access to every project of the organization.
    pub project_ids: Option<HashSet<ProjectId>>,
}

impl Caller {
    pub fn has_organization_access(&self, organization_id: OrganizationId) -> bool {
        self.organization_id == organization_id
    }

    /// A project-scoped caller needs access to at least one project of the release.
    pub fn has_release_permission(&self, release: &Release) -> bool {
        if !self.has_organization_access(release.organization_id) {
            return false;
        }

        match &self.project_ids {
            None => true,
            Some(allowed) => release.project_ids.iter().any(|p| allowed.contains(p)),
        }
    }
}

pub struct TokenStore {
    tokens: HashMap<String, Caller>,
}

impl TokenStore {
    pub fn new(tokens: &[TokenConfig]) -> Self {
        let tokens = tokens
            .iter()
            .map(|t| {
                let caller = Caller {
                    organization_id: t.organization,
                    project_ids: t.projects.as_ref().map(|p| p.iter().copied().collect()),
                };
                (t.token.clone(), caller)
            })
            .collect();

        TokenStore { tokens }
    }

    pub fn authenticate(&self, token: &str) -> Option<Caller> {
        self.tokens.get(token).cloned()
    }
}
