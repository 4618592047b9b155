//! Configuration loading
//!
//! Parses the `tracelibConfiguration` markup into filter trees, a
//! serializer choice, an output choice, trace keys, and storage retention
//! parameters. The loader selects the first `<process>` section whose
//! `<name>` matches the current executable (after platform adjustment);
//! `<tracekeys>` and `<storage>` are global siblings and apply regardless
//! of which process section matched.
//!
//! Everything structural is fatal: unknown elements, duplicated exclusive
//! elements, missing required elements, invalid attribute values. Unknown
//! serializer/output *option names* are logged and ignored. All detail
//! goes to the [`Log`]; the caller only learns success or failure.

use std::fs;
use std::ops::BitOr;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::filter::{Filter, TraceKeyMode, TraceKeySet};
use crate::log::Log;
use crate::matcher::{Matcher, MatchingMode};
use crate::output::{FileOutput, Output, StdoutOutput, TcpOutput, DEFAULT_PORT};
use crate::platform;
use crate::point::TracePoint;
use crate::serializer::Serializer;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that make a configuration unusable. The dispatcher reacts to all
/// of them the same way: every trace point becomes inactive.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration markup: {0}")]
    Markup(#[from] roxmltree::Error),

    #[error("unexpected root element <{0}>, expected <tracelibConfiguration>")]
    UnexpectedRoot(String),

    #[error("unexpected element <{element}> inside <{parent}>")]
    UnexpectedElement { parent: String, element: String },

    #[error("unknown filter element <{0}>")]
    UnknownFilter(String),

    #[error("duplicate <{0}> element")]
    DuplicateElement(&'static str),

    #[error("missing <{0}> element")]
    MissingElement(&'static str),

    #[error("empty <{0}> element")]
    EmptyElement(&'static str),

    #[error("<tracepointset> element without a filter")]
    MissingFilter,

    #[error("missing {attribute} attribute on <{element}> element")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("<output> of type {output} requires the '{option}' option")]
    MissingOption {
        output: &'static str,
        option: &'static str,
    },

    #[error("invalid value '{value}' for {what}")]
    InvalidValue { what: String, value: String },

    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// A configured trace key. Disabled keys are removed from every trace
/// point's effective key set before filter evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceKey {
    pub name: String,
    pub enabled: bool,
}

/// Retention parameters for the persisted trace store. All three are
/// required by the grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Store size above which a retention pass shrinks the store.
    pub maximum_trace_size: u64,
    /// Percentage of the store moved per shrink step, in `[1, 100]`.
    pub shrink_percentage: u8,
    /// Directory the archive files are written into.
    pub archive_directory: PathBuf,
}

/// Bitmask of actions a trace-point set applies to the points it accepts.
/// The yield bits include the log bit: capturing a backtrace or variables
/// is only meaningful for points that are logged at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actions(u32);

impl Actions {
    pub const IGNORE: Actions = Actions(0x0000);
    pub const LOG_TRACE_POINT: Actions = Actions(0x0001);
    pub const YIELD_BACKTRACE: Actions = Actions(0x0001 | 0x0100);
    pub const YIELD_VARIABLES: Actions = Actions(0x0001 | 0x0200);

    pub fn contains(self, other: Actions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Actions {
    type Output = Actions;

    fn bitor(self, rhs: Actions) -> Actions {
        Actions(self.0 | rhs.0)
    }
}

/// A filter tree paired with the actions applied to accepted points.
#[derive(Debug, Clone)]
pub struct TracePointSet {
    filter: Filter,
    actions: Actions,
}

impl TracePointSet {
    pub fn new(filter: Filter, actions: Actions) -> Self {
        Self { filter, actions }
    }

    pub fn actions(&self) -> Actions {
        self.actions
    }

    /// The actions this set applies to `point`, or `IGNORE`.
    pub fn consider(&self, point: &TracePoint, keys: &TraceKeySet) -> Actions {
        if self.filter.accepts(point, keys) {
            self.actions
        } else {
            Actions::IGNORE
        }
    }
}

/// A loaded configuration: the complete answer to "what gets traced, how,
/// and where does it go".
#[derive(Debug)]
pub struct Configuration {
    pub(crate) trace_point_sets: Vec<TracePointSet>,
    pub(crate) serializer: Serializer,
    pub(crate) output: Output,
    pub(crate) trace_keys: Vec<TraceKey>,
    pub(crate) storage: Option<StorageConfig>,
}

impl Configuration {
    /// An empty but valid configuration: no trace-point sets (every point
    /// is inactive), plaintext serializer, stdout output.
    pub fn empty() -> Self {
        Self {
            trace_point_sets: Vec::new(),
            serializer: Serializer::default(),
            output: Output::default(),
            trace_keys: Vec::new(),
            storage: None,
        }
    }

    pub fn add_trace_point_set(&mut self, set: TracePointSet) {
        self.trace_point_sets.push(set);
    }

    pub fn set_serializer(&mut self, serializer: Serializer) {
        self.serializer = serializer;
    }

    pub fn set_output(&mut self, output: Output) {
        self.output = output;
    }

    pub fn add_trace_key(&mut self, key: TraceKey) {
        self.trace_keys.push(key);
    }

    pub fn set_storage(&mut self, storage: StorageConfig) {
        self.storage = Some(storage);
    }

    pub fn trace_point_sets(&self) -> &[TracePointSet] {
        &self.trace_point_sets
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn trace_keys(&self) -> &[TraceKey] {
        &self.trace_keys
    }

    pub fn storage(&self) -> Option<&StorageConfig> {
        self.storage.as_ref()
    }

    /// The key view filters evaluate against.
    pub(crate) fn key_set(&self) -> TraceKeySet {
        let mut keys = TraceKeySet::new();
        for key in &self.trace_keys {
            if !key.enabled {
                keys.disable(&key.name);
            }
        }
        keys
    }

    /// Load from a configuration file for the current process. A missing
    /// or unreadable file yields `None` (every trace point stays
    /// inactive); malformed content is an error.
    pub fn from_file(path: &Path, log: &dyn Log) -> Result<Option<Configuration>> {
        Self::from_file_for_process(path, &platform::current_process_name(), log)
    }

    /// Like [`Configuration::from_file`] with an explicit process name.
    pub fn from_file_for_process(
        path: &Path,
        process_name: &str,
        log: &dyn Log,
    ) -> Result<Option<Configuration>> {
        let origin = path.display().to_string();
        if !path.exists() {
            log.write_status(&format!("configuration: no file at {}", origin));
            return Ok(None);
        }
        let markup = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                log.write_error(&format!("configuration: cannot read {}: {}", origin, err));
                return Ok(None);
            }
        };
        Loader {
            process_name,
            origin: &origin,
            log,
        }
        .load(&markup)
        .map(Some)
    }

    /// Load from an in-memory markup string for the current process.
    pub fn from_markup(markup: &str, log: &dyn Log) -> Result<Configuration> {
        Self::from_markup_for_process(markup, &platform::current_process_name(), log)
    }

    /// Like [`Configuration::from_markup`] with an explicit process name.
    pub fn from_markup_for_process(
        markup: &str,
        process_name: &str,
        log: &dyn Log,
    ) -> Result<Configuration> {
        Loader {
            process_name,
            origin: "<markup>",
            log,
        }
        .load(markup)
    }
}

struct Loader<'a> {
    process_name: &'a str,
    origin: &'a str,
    log: &'a dyn Log,
}

#[derive(Default)]
struct ProcessParts {
    serializer: Option<Serializer>,
    output: Option<Output>,
    sets: Vec<TracePointSet>,
}

impl<'a> Loader<'a> {
    fn load(&self, markup: &str) -> Result<Configuration> {
        match self.parse(markup) {
            Ok(configuration) => Ok(configuration),
            Err(err) => {
                self.log.write_error(&format!(
                    "configuration: while reading {}: {}",
                    self.origin, err
                ));
                Err(err)
            }
        }
    }

    fn parse(&self, markup: &str) -> Result<Configuration> {
        let doc = roxmltree::Document::parse(markup)?;
        let root = doc.root_element();
        if root.tag_name().name() != "tracelibConfiguration" {
            return Err(ConfigError::UnexpectedRoot(
                root.tag_name().name().to_string(),
            ));
        }

        let mut trace_keys = Vec::new();
        let mut storage: Option<StorageConfig> = None;
        let mut process_parts: Option<ProcessParts> = None;

        for element in root.children().filter(|n| n.is_element()) {
            match element.tag_name().name() {
                "process" => {
                    let name_element = element
                        .children()
                        .filter(|n| n.is_element())
                        .find(|n| n.tag_name().name() == "name")
                        .ok_or(ConfigError::MissingElement("name"))?;
                    let base_name = element_text(&name_element);
                    let platform_name = platform::executable_name(&base_name);
                    if process_parts.is_none()
                        && platform::process_names_equal(&platform_name, self.process_name)
                    {
                        self.log.write_status(&format!(
                            "configuration: found section for process {} (matches executable {})",
                            base_name, self.process_name
                        ));
                        process_parts = Some(self.read_process(&element)?);
                    }
                }
                "tracekeys" => self.read_trace_keys(&element, &mut trace_keys)?,
                "storage" => {
                    if storage.is_some() {
                        return Err(ConfigError::DuplicateElement("storage"));
                    }
                    storage = Some(self.read_storage(&element)?);
                }
                other => {
                    return Err(ConfigError::UnexpectedElement {
                        parent: "tracelibConfiguration".to_string(),
                        element: other.to_string(),
                    })
                }
            }
        }

        let parts = match process_parts {
            Some(parts) => parts,
            None => {
                self.log.write_status(&format!(
                    "configuration: no section for process {}",
                    self.process_name
                ));
                ProcessParts::default()
            }
        };

        Ok(Configuration {
            trace_point_sets: parts.sets,
            serializer: parts.serializer.unwrap_or_default(),
            output: parts.output.unwrap_or_default(),
            trace_keys,
            storage,
        })
    }

    fn read_process(&self, element: &roxmltree::Node) -> Result<ProcessParts> {
        let mut parts = ProcessParts::default();
        for child in element.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "name" => {}
                "serializer" => {
                    if parts.serializer.is_some() {
                        return Err(ConfigError::DuplicateElement("serializer"));
                    }
                    parts.serializer = Some(self.read_serializer(&child)?);
                }
                "tracepointset" => parts.sets.push(self.read_trace_point_set(&child)?),
                "output" => {
                    if parts.output.is_some() {
                        return Err(ConfigError::DuplicateElement("output"));
                    }
                    parts.output = Some(self.read_output(&child)?);
                }
                other => {
                    return Err(ConfigError::UnexpectedElement {
                        parent: "process".to_string(),
                        element: other.to_string(),
                    })
                }
            }
        }
        Ok(parts)
    }

    fn read_serializer(&self, element: &roxmltree::Node) -> Result<Serializer> {
        let serializer_type = element.attribute("type").ok_or(ConfigError::MissingAttribute {
            element: "serializer",
            attribute: "type",
        })?;

        match serializer_type {
            "plaintext" => {
                let mut timestamps = true;
                for (name, value) in self.read_options(element, "serializer")? {
                    match name.as_str() {
                        "timestamps" => timestamps = value == "yes",
                        other => self.report_unknown_option("plaintext serializer", other),
                    }
                }
                self.log
                    .write_status("configuration: using plaintext serializer");
                Ok(Serializer::Plaintext { timestamps })
            }
            "xml" => {
                let mut beautified = false;
                for (name, value) in self.read_options(element, "serializer")? {
                    match name.as_str() {
                        "beautifiedOutput" => beautified = value == "yes",
                        other => self.report_unknown_option("xml serializer", other),
                    }
                }
                self.log.write_status(&format!(
                    "configuration: using XML serializer (beautified output={})",
                    beautified
                ));
                Ok(Serializer::Xml { beautified })
            }
            other => Err(ConfigError::InvalidValue {
                what: "type attribute of <serializer>".to_string(),
                value: other.to_string(),
            }),
        }
    }

    fn read_output(&self, element: &roxmltree::Node) -> Result<Output> {
        let output_type = element.attribute("type").ok_or(ConfigError::MissingAttribute {
            element: "output",
            attribute: "type",
        })?;

        match output_type {
            "stdout" => {
                self.log.write_status("configuration: using stdout output");
                Ok(Output::Stdout(StdoutOutput))
            }
            "file" => {
                let mut filename = String::new();
                let mut overwrite_existing = true;
                let mut relative_to_user_home = false;
                for (name, value) in self.read_options(element, "output")? {
                    match name.as_str() {
                        "filename" => filename = value,
                        "overwriteExistingFile" => overwrite_existing = value == "true",
                        "relativeToUserHome" => relative_to_user_home = value == "true",
                        other => self.report_unknown_option("file output", other),
                    }
                }
                if filename.is_empty() {
                    return Err(ConfigError::MissingOption {
                        output: "file",
                        option: "filename",
                    });
                }
                self.log.write_status(&format!(
                    "configuration: using file output to {}",
                    filename
                ));
                Ok(Output::File(FileOutput::new(
                    &filename,
                    overwrite_existing,
                    relative_to_user_home,
                )))
            }
            "tcp" => {
                let mut host = String::new();
                let mut port = DEFAULT_PORT;
                for (name, value) in self.read_options(element, "output")? {
                    match name.as_str() {
                        "host" => host = value,
                        "port" => {
                            port = value.parse().map_err(|_| ConfigError::InvalidValue {
                                what: "'port' option of tcp output".to_string(),
                                value: value.clone(),
                            })?;
                        }
                        other => self.report_unknown_option("tcp output", other),
                    }
                }
                if host.is_empty() {
                    return Err(ConfigError::MissingOption {
                        output: "tcp",
                        option: "host",
                    });
                }
                if port == 0 {
                    return Err(ConfigError::InvalidValue {
                        what: "'port' option of tcp output".to_string(),
                        value: "0".to_string(),
                    });
                }
                self.log.write_status(&format!(
                    "configuration: using TCP/IP output, remote = {}:{}",
                    host, port
                ));
                Ok(Output::Tcp(TcpOutput::new(&host, port)))
            }
            other => Err(ConfigError::InvalidValue {
                what: "type attribute of <output>".to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Collect `<option name="...">value</option>` children. Options with
    /// no name attribute are logged and skipped; any other child element
    /// is fatal.
    fn read_options(
        &self,
        element: &roxmltree::Node,
        parent: &str,
    ) -> Result<Vec<(String, String)>> {
        let mut options = Vec::new();
        for child in element.children().filter(|n| n.is_element()) {
            if child.tag_name().name() != "option" {
                return Err(ConfigError::UnexpectedElement {
                    parent: parent.to_string(),
                    element: child.tag_name().name().to_string(),
                });
            }
            match child.attribute("name") {
                Some(name) => options.push((name.to_string(), element_text(&child))),
                None => self.log.write_error(&format!(
                    "configuration: while reading {}: <option> element without name attribute; ignoring it",
                    self.origin
                )),
            }
        }
        Ok(options)
    }

    fn report_unknown_option(&self, context: &str, name: &str) {
        self.log.write_error(&format!(
            "configuration: while reading {}: unknown option '{}' in {}; ignoring it",
            self.origin, name, context
        ));
    }

    fn read_trace_point_set(&self, element: &roxmltree::Node) -> Result<TracePointSet> {
        let backtraces = self.yes_no_attribute(element, "backtraces")?;
        let variables = self.yes_no_attribute(element, "variables")?;

        let mut children = Vec::new();
        for filter_element in element.children().filter(|n| n.is_element()) {
            children.push(self.read_filter(&filter_element)?);
        }
        if children.is_empty() {
            return Err(ConfigError::MissingFilter);
        }

        let mut actions = Actions::LOG_TRACE_POINT;
        if backtraces {
            actions = actions | Actions::YIELD_BACKTRACE;
        }
        if variables {
            actions = actions | Actions::YIELD_VARIABLES;
        }
        Ok(TracePointSet::new(Filter::MatchAll(children), actions))
    }

    fn yes_no_attribute(&self, element: &roxmltree::Node, attribute: &str) -> Result<bool> {
        match element.attribute(attribute) {
            None => Ok(false),
            Some("yes") => Ok(true),
            Some("no") => Ok(false),
            Some(other) => Err(ConfigError::InvalidValue {
                what: format!("{} attribute of <tracepointset>", attribute),
                value: other.to_string(),
            }),
        }
    }

    fn read_filter(&self, element: &roxmltree::Node) -> Result<Filter> {
        match element.tag_name().name() {
            "matchanyfilter" => {
                let mut children = Vec::new();
                for child in element.children().filter(|n| n.is_element()) {
                    children.push(self.read_filter(&child)?);
                }
                Ok(Filter::MatchAny(children))
            }
            "matchallfilter" => {
                let mut children = Vec::new();
                for child in element.children().filter(|n| n.is_element()) {
                    children.push(self.read_filter(&child)?);
                }
                Ok(Filter::MatchAll(children))
            }
            "pathfilter" => Ok(Filter::Path(self.read_matcher(element, "pathfilter")?)),
            "functionfilter" => Ok(Filter::Function(
                self.read_matcher(element, "functionfilter")?,
            )),
            "tracekeyfilter" => {
                let mode = match element.attribute("mode") {
                    None => TraceKeyMode::Whitelist,
                    Some(value) => {
                        TraceKeyMode::from_name(value).ok_or_else(|| ConfigError::InvalidValue {
                            what: "mode attribute of <tracekeyfilter>".to_string(),
                            value: value.to_string(),
                        })?
                    }
                };
                let mut names = Vec::new();
                for child in element.children().filter(|n| n.is_element()) {
                    if child.tag_name().name() != "key" {
                        return Err(ConfigError::UnexpectedElement {
                            parent: "tracekeyfilter".to_string(),
                            element: child.tag_name().name().to_string(),
                        });
                    }
                    names.push(element_text(&child));
                }
                Ok(Filter::TraceKeys { mode, names })
            }
            other => Err(ConfigError::UnknownFilter(other.to_string())),
        }
    }

    fn read_matcher(&self, element: &roxmltree::Node, tag: &str) -> Result<Matcher> {
        let mode = match element.attribute("matchingmode") {
            None => MatchingMode::StrictMatch,
            Some(value) => {
                MatchingMode::from_name(value).ok_or_else(|| ConfigError::InvalidValue {
                    what: format!("matchingmode attribute of <{}>", tag),
                    value: value.to_string(),
                })?
            }
        };
        let pattern = element_text(element);
        Matcher::new(mode, &pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern,
            source,
        })
    }

    fn read_trace_keys(
        &self,
        element: &roxmltree::Node,
        out: &mut Vec<TraceKey>,
    ) -> Result<()> {
        for child in element.children().filter(|n| n.is_element()) {
            if child.tag_name().name() != "key" {
                return Err(ConfigError::UnexpectedElement {
                    parent: "tracekeys".to_string(),
                    element: child.tag_name().name().to_string(),
                });
            }
            let enabled = match child.attribute("enabled") {
                None => true,
                Some("true") => true,
                Some("false") => false,
                Some(other) => {
                    return Err(ConfigError::InvalidValue {
                        what: "enabled attribute of <key>".to_string(),
                        value: other.to_string(),
                    })
                }
            };
            out.push(TraceKey {
                name: element_text(&child),
                enabled,
            });
        }
        Ok(())
    }

    fn read_storage(&self, element: &roxmltree::Node) -> Result<StorageConfig> {
        let mut maximum_size: Option<u64> = None;
        let mut shrink_by: Option<u8> = None;
        let mut archive_directory: Option<String> = None;

        for child in element.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "maximumSize" => {
                    if maximum_size.is_some() {
                        return Err(ConfigError::DuplicateElement("maximumSize"));
                    }
                    let text = element_text(&child);
                    if text.is_empty() {
                        return Err(ConfigError::EmptyElement("maximumSize"));
                    }
                    maximum_size =
                        Some(text.parse().map_err(|_| ConfigError::InvalidValue {
                            what: "<maximumSize> element".to_string(),
                            value: text.clone(),
                        })?);
                }
                "shrinkBy" => {
                    if shrink_by.is_some() {
                        return Err(ConfigError::DuplicateElement("shrinkBy"));
                    }
                    let text = element_text(&child);
                    if text.is_empty() {
                        return Err(ConfigError::EmptyElement("shrinkBy"));
                    }
                    let percentage: u8 =
                        text.parse().map_err(|_| ConfigError::InvalidValue {
                            what: "<shrinkBy> element".to_string(),
                            value: text.clone(),
                        })?;
                    if percentage == 0 || percentage > 100 {
                        return Err(ConfigError::InvalidValue {
                            what: "<shrinkBy> element".to_string(),
                            value: text.clone(),
                        });
                    }
                    shrink_by = Some(percentage);
                }
                "archiveDirectory" => {
                    if archive_directory.is_some() {
                        return Err(ConfigError::DuplicateElement("archiveDirectory"));
                    }
                    let text = element_text(&child);
                    if text.is_empty() {
                        return Err(ConfigError::EmptyElement("archiveDirectory"));
                    }
                    archive_directory = Some(text);
                }
                other => {
                    return Err(ConfigError::UnexpectedElement {
                        parent: "storage".to_string(),
                        element: other.to_string(),
                    })
                }
            }
        }

        Ok(StorageConfig {
            maximum_trace_size: maximum_size.ok_or(ConfigError::MissingElement("maximumSize"))?,
            shrink_percentage: shrink_by.ok_or(ConfigError::MissingElement("shrinkBy"))?,
            archive_directory: PathBuf::from(
                archive_directory.ok_or(ConfigError::MissingElement("archiveDirectory"))?,
            ),
        })
    }
}

fn element_text(node: &roxmltree::Node) -> String {
    node.text().unwrap_or("").trim().to_string()
}
