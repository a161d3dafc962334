//! Name-to-source lookup, caching, include-path search and protocol
//! resolvers.

pub mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use pat_diagnostics::SourceId;

pub use error::Error;

/// An immutable, registered piece of pattern-language source text.
#[derive(Debug)]
pub struct Source {
    content: String,
    name: String,
    id: SourceId,
}

impl Source {
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> SourceId {
        self.id
    }
}

/// Owns the set of registered sources and hands out stable ids. Kept
/// separate from [`Resolver`] so a runtime can register virtual/in-memory
/// sources without going through a protocol handler.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self { sources: vec![Arc::new(Source { content: String::new(), name: "<empty>".into(), id: pat_diagnostics::EMPTY_SOURCE })] }
    }

    pub fn register(&mut self, name: impl Into<String>, content: impl Into<String>) -> Arc<Source> {
        let id = self.sources.len() as SourceId;
        let source = Arc::new(Source { content: content.into(), name: name.into(), id });
        self.sources.push(source.clone());
        source
    }

    pub fn get(&self, id: SourceId) -> Option<&Arc<Source>> {
        self.sources.get(id as usize)
    }
}

/// A per-protocol source-fetching strategy (`file://`, `git://`, a virtual
/// in-memory scheme, ...).
pub trait ProtocolHandler: Send + Sync {
    fn resolve(&self, path: &str, registry: &mut SourceRegistry) -> Result<Arc<Source>, Error>;
}

/// Resolves a name to a [`Source`], dispatching on a `protocol://` prefix,
/// caching results by path so repeated resolution of the same path returns
/// the same stable pointer.
pub struct Resolver {
    protocols: AHashMap<String, Box<dyn ProtocolHandler>>,
    default: Option<Box<dyn ProtocolHandler>>,
    cache: AHashMap<String, Arc<Source>>,
    registry: SourceRegistry,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            protocols: AHashMap::new(),
            default: None,
            cache: AHashMap::new(),
            registry: SourceRegistry::new(),
        }
    }

    pub fn register_protocol(&mut self, prefix: impl Into<String>, handler: Box<dyn ProtocolHandler>) {
        self.protocols.insert(prefix.into(), handler);
    }

    pub fn set_default(&mut self, handler: Box<dyn ProtocolHandler>) {
        self.default = Some(handler);
    }

    pub fn add_virtual(&mut self, code: impl Into<String>, name: impl Into<String>) -> Arc<Source> {
        let name = name.into();
        let source = self.registry.register(name.clone(), code);
        self.cache.insert(name, source.clone());
        source
    }

    pub fn resolve(&mut self, path: &str) -> Result<Arc<Source>, Error> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }

        let source = if let Some((protocol, rest)) = path.split_once("://") {
            let handler = self
                .protocols
                .get(protocol)
                .ok_or_else(|| Error::UnknownProtocol(protocol.to_string()))?;
            handler.resolve(rest, &mut self.registry)?
        } else {
            let handler = self
                .default
                .as_ref()
                .ok_or_else(|| Error::Unresolved { path: path.to_string(), tried: vec![] })?;
            handler.resolve(path, &mut self.registry)?
        };

        self.cache.insert(path.to_string(), source.clone());
        Ok(source)
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }
}

/// Resolves bare paths and `file://` paths against a list of include
/// directories, trying the `hexpat`, `pat` extensions in order when the
/// given path has none.
pub struct FileResolver {
    include_paths: Vec<PathBuf>,
}

const DEFAULT_EXTENSIONS: &[&str] = &["hexpat", "pat"];

impl FileResolver {
    pub fn new(include_paths: Vec<PathBuf>) -> Self {
        Self { include_paths }
    }

    fn candidates(&self, path: &str) -> Vec<PathBuf> {
        let given = Path::new(path);
        let mut out = Vec::new();

        let bases: Vec<PathBuf> = if given.is_absolute() {
            vec![PathBuf::new()]
        } else {
            let mut bases = vec![PathBuf::new()];
            bases.extend(self.include_paths.iter().cloned());
            bases
        };

        for base in bases {
            let full = base.join(given);
            if full.extension().is_some() {
                out.push(full);
            } else {
                for ext in DEFAULT_EXTENSIONS {
                    out.push(full.with_extension(ext));
                }
            }
        }

        out
    }
}

impl ProtocolHandler for FileResolver {
    fn resolve(&self, path: &str, registry: &mut SourceRegistry) -> Result<Arc<Source>, Error> {
        let candidates = self.candidates(path);

        for candidate in &candidates {
            if candidate.is_file() {
                log::debug!("resolved `{}` to `{}`", path, candidate.display());
                let content = std::fs::read_to_string(candidate).map_err(|source| Error::Io {
                    path: candidate.display().to_string(),
                    source,
                })?;
                return Ok(registry.register(candidate.display().to_string(), content));
            }
        }

        Err(Error::Unresolved {
            path: path.to_string(),
            tried: candidates.into_iter().map(|p| p.display().to_string()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_virtual_source() {
        let mut resolver = Resolver::new();
        let source = resolver.add_virtual("struct P {};", "inline");
        assert_eq!(source.content(), "struct P {};");

        let again = resolver.resolve("inline").unwrap();
        assert!(Arc::ptr_eq(&source, &again));
    }

    #[test]
    fn file_resolver_tries_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("types.pat");
        writeln!(std::fs::File::create(&file_path).unwrap(), "struct S {{}};").unwrap();

        let mut resolver = Resolver::new();
        resolver.set_default(Box::new(FileResolver::new(vec![dir.path().to_path_buf()])));

        let source = resolver.resolve("types").unwrap();
        assert!(source.content().contains("struct S"));
    }

    #[test]
    fn unresolved_path_lists_tried_locations() {
        let mut resolver = Resolver::new();
        resolver.set_default(Box::new(FileResolver::new(vec![])));

        let err = resolver.resolve("missing").unwrap_err();
        match err {
            Error::Unresolved { tried, .. } => assert_eq!(tried.len(), DEFAULT_EXTENSIONS.len()),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
