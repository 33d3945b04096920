use crate::codec::{Codec, CodecProvider, CompressorProvider};
use crate::error::ConfigError;
use crate::layer::CompressionLayer;
use compression_core::Level;
use http::HeaderValue;
use std::fmt;
use std::sync::Arc;

/// Default minimum body size for compression.
///
/// Shorter bodies often come out larger than they went in.
pub const DEFAULT_MIN_SIZE: usize = 200;

/// Whose preference decides between several acceptable codings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Prefer {
    /// Order by server priority; client quality only accepts or rejects.
    #[default]
    Server,
    /// Order by client quality; server priority breaks ties.
    Client,
}

/// How a [`ContentTypeFilter`] treats its patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterMode {
    /// Only matching content types are compressed.
    #[default]
    Allow,
    /// Matching content types are never compressed.
    Deny,
}

/// Content types eligible for compression.
///
/// An empty filter allows everything, as does a response without a
/// `Content-Type`.
#[derive(Debug, Clone, Default)]
pub struct ContentTypeFilter {
    patterns: Vec<MediaPattern>,
    mode: FilterMode,
}

impl ContentTypeFilter {
    /// Parses `patterns` into a filter.
    ///
    /// Accepted forms are `type/subtype`, `type/subtype; key=value`, `type/*`
    /// and `*/*`, compared case-insensitively.
    pub fn new<I, S>(patterns: I, mode: FilterMode) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                MediaPattern::parse(pattern)
                    .ok_or_else(|| ConfigError::InvalidContentType(pattern.to_owned()))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns, mode })
    }

    /// Returns whether a response with this `Content-Type` may be compressed.
    pub fn allows(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return true;
        };
        if self.patterns.is_empty() {
            return true;
        }
        let Some(media) = MediaType::parse(content_type) else {
            // unparseable types only match a catch-all pattern
            let matched = self.patterns.iter().any(|p| p.is_catch_all());
            return matched == (self.mode == FilterMode::Allow);
        };

        let matched = self.patterns.iter().any(|p| p.matches(&media));
        match self.mode {
            FilterMode::Allow => matched,
            FilterMode::Deny => !matched,
        }
    }
}

/// A parsed, lower-cased media type.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MediaType {
    essence: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(';');
        let essence = parts.next()?.trim().to_ascii_lowercase();
        let (ty, subtype) = essence.split_once('/')?;
        if ty.is_empty() || subtype.is_empty() || subtype.contains('/') {
            return None;
        }

        let mut params = Vec::new();
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            params.push((key.trim().to_ascii_lowercase(), value.to_ascii_lowercase()));
        }
        params.sort();

        Some(Self { essence, params })
    }
}

/// A content type filter entry.
#[derive(Debug, Clone)]
enum MediaPattern {
    /// `type/*` stored as `type/`, or `*/*` stored as the empty prefix.
    Prefix(String),
    Exact(MediaType),
}

impl MediaPattern {
    fn parse(s: &str) -> Option<Self> {
        let media = MediaType::parse(s)?;
        if media.essence == "*/*" {
            return Some(Self::Prefix(String::new()));
        }
        if let Some(prefix) = media.essence.strip_suffix('*') {
            return prefix
                .ends_with('/')
                .then(|| Self::Prefix(prefix.to_owned()));
        }
        if media.essence.contains('*') {
            return None;
        }
        Some(Self::Exact(media))
    }

    fn is_catch_all(&self) -> bool {
        matches!(self, Self::Prefix(prefix) if prefix.is_empty())
    }

    fn matches(&self, media: &MediaType) -> bool {
        match self {
            Self::Prefix(prefix) => media.essence.starts_with(prefix.as_str()),
            // a pattern without parameters matches any parameters
            Self::Exact(pattern) if pattern.params.is_empty() => pattern.essence == media.essence,
            Self::Exact(pattern) => pattern == media,
        }
    }
}

/// A registered content coding.
#[derive(Clone)]
pub struct Coding {
    name: Arc<str>,
    header: HeaderValue,
    priority: i32,
    provider: Arc<dyn CompressorProvider>,
}

impl Coding {
    /// Returns the lower-cased coding name, as sent in `Content-Encoding`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tie-break priority; higher is preferred.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn header_value(&self) -> &HeaderValue {
        &self.header
    }

    pub(crate) fn provider(&self) -> &dyn CompressorProvider {
        self.provider.as_ref()
    }

    /// Returns whether an `Accept-Encoding` token names this coding.
    pub(crate) fn matches(&self, token: &str) -> bool {
        token.eq_ignore_ascii_case(&self.name)
            || (&*self.name == "gzip" && token.eq_ignore_ascii_case("x-gzip"))
    }
}

impl fmt::Debug for Coding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coding")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Immutable middleware configuration, shared read-only by all requests.
#[derive(Debug, Clone)]
pub struct Config {
    min_size: usize,
    content_types: ContentTypeFilter,
    prefer: Prefer,
    codings: Vec<Coding>,
}

impl Config {
    /// Every compiled-in codec at its default level.
    pub(crate) fn defaults() -> Self {
        let codings = [Codec::Deflate, Codec::Gzip, Codec::Brotli, Codec::Zstd]
            .into_iter()
            .filter(Codec::is_supported)
            .filter_map(|codec| builtin_coding(codec, CodecProvider::new(codec, Level::Default)))
            .collect();

        Self {
            codings,
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            content_types: ContentTypeFilter::default(),
            prefer: Prefer::default(),
            codings: Vec::new(),
        }
    }

    /// Minimum body size worth compressing.
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Content types eligible for compression.
    pub fn content_types(&self) -> &ContentTypeFilter {
        &self.content_types
    }

    /// Preference policy used to order acceptable codings.
    pub fn prefer(&self) -> Prefer {
        self.prefer
    }

    /// Registered codings, ordered by name.
    pub fn codings(&self) -> &[Coding] {
        &self.codings
    }

    /// Returns true when no coding is registered and the middleware is an
    /// identity wrapper.
    pub fn is_noop(&self) -> bool {
        self.codings.is_empty()
    }

    fn apply(&mut self, setting: Setting) -> Result<(), ConfigError> {
        match setting {
            Setting::MinSize(size) => self.min_size = size,
            Setting::ContentTypes(filter) => self.content_types = filter?,
            Setting::Prefer(prefer) => self.prefer = prefer,
            Setting::Coding {
                name,
                priority,
                provider,
            } => {
                let provider = provider?;
                let name = validate_coding_name(&name)?;
                let coding = Coding {
                    header: HeaderValue::from_str(&name)
                        .map_err(|_| ConfigError::InvalidCodingName(name.clone()))?,
                    name: name.into(),
                    priority,
                    provider,
                };
                match self.codings.binary_search_by(|c| c.name.cmp(&coding.name)) {
                    Ok(index) => self.codings[index] = coding,
                    Err(index) => self.codings.insert(index, coding),
                }
            }
        }
        Ok(())
    }
}

/// Lower-cases `name` and checks it is a registrable token.
/// Wraps a built-in provider, leaving the codec out if it failed to construct.
fn builtin_coding(codec: Codec, provider: Result<CodecProvider, ConfigError>) -> Option<Coding> {
    match provider {
        Ok(provider) => Some(Coding {
            name: codec.content_encoding().into(),
            header: HeaderValue::from_static(codec.content_encoding()),
            priority: codec.priority(),
            provider: Arc::new(provider),
        }),
        Err(error) => {
            tracing::warn!(coding = codec.content_encoding(), %error, "default codec unavailable");
            None
        }
    }
}

fn validate_coding_name(name: &str) -> Result<String, ConfigError> {
    let is_tchar = |b: u8| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b);
    let lower = name.to_ascii_lowercase();
    if lower.is_empty()
        || !lower.bytes().all(is_tchar)
        || lower == "identity"
        || lower == "*"
    {
        return Err(ConfigError::InvalidCodingName(name.to_owned()));
    }
    Ok(lower)
}

/// One recorded builder call.
enum Setting {
    MinSize(usize),
    ContentTypes(Result<ContentTypeFilter, ConfigError>),
    Prefer(Prefer),
    Coding {
        name: String,
        priority: i32,
        provider: Result<Arc<dyn CompressorProvider>, ConfigError>,
    },
}

/// Builds a [`CompressionLayer`] from a sequence of settings.
///
/// Settings are applied in the order they were given, later ones overriding
/// earlier ones. Validation errors are reported by [`build`](Builder::build),
/// which never returns a partially configured layer.
///
/// A builder with no codings produces a layer that leaves requests and
/// responses untouched.
#[derive(Default)]
pub struct Builder {
    settings: Vec<Setting>,
}

impl Builder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum body size required for compression.
    pub fn min_size(mut self, size: usize) -> Self {
        self.settings.push(Setting::MinSize(size));
        self
    }

    /// Restricts compression by response content type.
    pub fn content_types<I, S>(mut self, patterns: I, mode: FilterMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.settings.push(Setting::ContentTypes(ContentTypeFilter::new(
            patterns, mode,
        )));
        self
    }

    /// Sets whose preference orders acceptable codings.
    pub fn prefer(mut self, prefer: Prefer) -> Self {
        self.settings.push(Setting::Prefer(prefer));
        self
    }

    /// Enables a built-in codec at `level` with its default priority.
    pub fn codec(mut self, codec: Codec, level: Level) -> Self {
        let provider = CodecProvider::new(codec, level)
            .map(|provider| Arc::new(provider) as Arc<dyn CompressorProvider>);
        self.settings.push(Setting::Coding {
            name: codec.content_encoding().to_owned(),
            priority: codec.priority(),
            provider,
        });
        self
    }

    /// Enables gzip at `level`.
    pub fn gzip(self, level: Level) -> Self {
        self.codec(Codec::Gzip, level)
    }

    /// Enables deflate at `level`.
    pub fn deflate(self, level: Level) -> Self {
        self.codec(Codec::Deflate, level)
    }

    /// Enables brotli at `level`.
    pub fn brotli(self, level: Level) -> Self {
        self.codec(Codec::Brotli, level)
    }

    /// Enables zstd at `level`.
    pub fn zstd(self, level: Level) -> Self {
        self.codec(Codec::Zstd, level)
    }

    /// Registers a custom provider for the coding `name`.
    ///
    /// Registering a name again replaces the earlier provider. Higher
    /// priorities are preferred; the built-in codecs use -300 to -50.
    pub fn compressor<P>(mut self, name: impl Into<String>, priority: i32, provider: P) -> Self
    where
        P: CompressorProvider,
    {
        self.settings.push(Setting::Coding {
            name: name.into(),
            priority,
            provider: Ok(Arc::new(provider)),
        });
        self
    }

    /// Validates the settings and builds the configuration.
    pub fn build_config(self) -> Result<Config, ConfigError> {
        let mut config = Config::empty();
        for setting in self.settings {
            config.apply(setting)?;
        }
        Ok(config)
    }

    /// Validates the settings and builds the layer.
    pub fn build(self) -> Result<CompressionLayer, ConfigError> {
        self.build_config().map(CompressionLayer::from_config)
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("settings", &self.settings.len())
            .finish()
    }
}
