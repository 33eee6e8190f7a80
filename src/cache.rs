use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use tracing::trace;

use crate::error::IdentError;

/// Normalized `(package, class)` identity pair.
///
/// This pair alone defines cache-key equality; the descriptor a key was
/// built from never does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentIdent {
    package: Box<str>,
    class: Box<str>,
}

impl ComponentIdent {
    /// Build an identity pair, expanding the `.Name` class shorthand
    /// against the package.
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        let package = package.into();
        let mut class = class.into();
        if class.starts_with('.') {
            class = format!("{package}{class}");
        }

        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Parse the flattened `package/class` form.
    pub fn parse(flat: &str) -> Result<Self, IdentError> {
        let (package, class) = flat
            .split_once('/')
            .ok_or_else(|| IdentError::MissingSeparator(flat.to_string()))?;

        if package.is_empty() || class.is_empty() {
            return Err(IdentError::EmptyPart(flat.to_string()));
        }

        Ok(Self::new(package, class))
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// The flattened `package/class` form.
    pub fn flatten(&self) -> String {
        format!("{}/{}", self.package, self.class)
    }
}

impl fmt::Display for ComponentIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

/// Source descriptor for an installed application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub component: ComponentIdent,
}

impl AppDescriptor {
    pub fn new(component: ComponentIdent) -> Self {
        Self { component }
    }
}

/// Source descriptor for a component resolved from an intent-style query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveDescriptor {
    pub component: ComponentIdent,
}

impl ResolveDescriptor {
    pub fn new(component: ComponentIdent) -> Self {
        Self { component }
    }
}

/// Source descriptor for a widget provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetProviderDescriptor {
    pub provider: ComponentIdent,
}

impl WidgetProviderDescriptor {
    pub fn new(provider: ComponentIdent) -> Self {
        Self { provider }
    }
}

/// The identity kind a cache key was built from. Scopes bulk retention;
/// deliberately excluded from key equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Application,
    ResolvedComponent,
    WidgetProvider,
}

/// Key into an [`OutlineCache`].
///
/// Equality and hashing consider only the identity pair. Two keys built
/// from different descriptor kinds but the same `(package, class)` pair
/// are equal and collide in the cache; identity is the pair, not the
/// provenance.
#[derive(Debug, Clone)]
pub struct CacheKey {
    kind: KeyKind,
    ident: ComponentIdent,
}

impl CacheKey {
    pub fn from_app(app: &AppDescriptor) -> Self {
        Self {
            kind: KeyKind::Application,
            ident: app.component.clone(),
        }
    }

    pub fn from_resolved(info: &ResolveDescriptor) -> Self {
        Self {
            kind: KeyKind::ResolvedComponent,
            ident: info.component.clone(),
        }
    }

    pub fn from_widget_provider(provider: &WidgetProviderDescriptor) -> Self {
        Self {
            kind: KeyKind::WidgetProvider,
            ident: provider.provider.clone(),
        }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn ident(&self) -> &ComponentIdent {
        &self.ident
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.ident == other.ident
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ident.hash(state);
    }
}

/// An owned artifact whose backing resource must be released explicitly
/// when the cache evicts it.
pub trait Releasable {
    fn release(&mut self);
}

/// Identity-keyed cache of generated artifacts with type-scoped bulk
/// eviction.
///
/// The cache is single-owner: all access goes through these methods, and
/// evictions release the held artifact exactly once.
#[derive(Debug, Default)]
pub struct OutlineCache<A: Releasable> {
    entries: HashMap<CacheKey, A>,
}

impl<A: Releasable> OutlineCache<A> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the entry for `key`.
    ///
    /// A replaced artifact is returned *without* being released; callers
    /// that intend to replace an entry should [`Self::remove_outline`]
    /// first, or release the returned artifact themselves.
    pub fn add_outline(&mut self, key: CacheKey, artifact: A) -> Option<A> {
        self.entries.insert(key, artifact)
    }

    /// Release and remove the entry for `key`, if present.
    pub fn remove_outline(&mut self, key: &CacheKey) {
        if let Some(mut artifact) = self.entries.remove(key) {
            trace!(key = %key.ident, "releasing cached outline");
            artifact.release();
        }
    }

    /// Artifact cached under `key`, if any.
    pub fn get_outline(&self, key: &CacheKey) -> Option<&A> {
        self.entries.get(key)
    }

    /// Evict every entry of `kind` whose key is absent from
    /// `keys_to_keep`, releasing the artifacts. Entries of other kinds
    /// are left untouched, whether or not `keys_to_keep` mentions them.
    pub fn retain(&mut self, keys_to_keep: &HashSet<CacheKey>, kind: KeyKind) {
        let stale: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|key| key.kind() == kind && !keys_to_keep.contains(key))
            .cloned()
            .collect();

        for key in stale {
            self.remove_outline(&key);
        }
    }

    /// Keep only the application entries still present in `apps`.
    pub fn retain_apps(&mut self, apps: &[AppDescriptor]) {
        let keep = apps.iter().map(CacheKey::from_app).collect();
        self.retain(&keep, KeyKind::Application);
    }

    /// Keep only the resolved-component entries still present in `infos`.
    pub fn retain_resolved(&mut self, infos: &[ResolveDescriptor]) {
        let keep = infos.iter().map(CacheKey::from_resolved).collect();
        self.retain(&keep, KeyKind::ResolvedComponent);
    }

    /// Keep only the widget-provider entries still present in
    /// `providers`.
    pub fn retain_widget_providers(&mut self, providers: &[WidgetProviderDescriptor]) {
        let keep = providers.iter().map(CacheKey::from_widget_provider).collect();
        self.retain(&keep, KeyKind::WidgetProvider);
    }

    /// Release every held artifact and empty the cache, regardless of
    /// kind.
    pub fn clear(&mut self) {
        trace!(count = self.entries.len(), "clearing outline cache");
        for (_, mut artifact) in self.entries.drain() {
            artifact.release();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
