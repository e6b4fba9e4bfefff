//! Results of the offline dependency analysis.
//!
//! A separate analysis pass over a full capture records which objects, commands, descriptors and
//! acceleration structures the frames of a subcapture actually touch. The artifact is plain
//! text: whitespace-separated integers grouped under section headers.
//!
//! ```text
//! 12 15                      <- command lists (no header)
//! COMMAND_QUEUE_COMMANDS
//! 1040 1041
//! OBJECTS
//! 3 7 12
//! DESCRIPTORS
//! 9 0  9 4                   <- (heap, index) pairs
//! ACCELERATION_STRUCTURES
//! 42 0                       <- (resource, offset) pairs
//! ```
//!
//! The results only ever narrow what gets restored. Without an artifact, or for a section that
//! is empty, every predicate answers "required".

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::model::{CommandKey, KeyOffset, ObjectKey};

const COMMAND_QUEUE_COMMANDS: &str = "COMMAND_QUEUE_COMMANDS";
const OBJECTS: &str = "OBJECTS";
const DESCRIPTORS: &str = "DESCRIPTORS";
const ACCELERATION_STRUCTURES: &str = "ACCELERATION_STRUCTURES";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("unknown section header {0:?}")]
    UnknownSection(String),

    #[error("invalid integer {0:?}")]
    InvalidInteger(String),

    #[error("section {section} holds pairs but has an odd number of values")]
    UnpairedValue { section: &'static str },

    #[error("failed to read analysis artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    CommandLists,
    CommandQueueCommands,
    Objects,
    Descriptors,
    AccelerationStructures,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalyzerResults {
    loaded: bool,
    command_lists: BTreeSet<ObjectKey>,
    command_queue_commands: BTreeSet<CommandKey>,
    objects: BTreeSet<ObjectKey>,
    descriptors: BTreeSet<(ObjectKey, u32)>,
    acceleration_structures: BTreeSet<KeyOffset>,
}

impl AnalyzerResults {
    /// Results of a session without an artifact: everything is required.
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, AnalysisError> {
        let mut section = Section::CommandLists;
        let mut values: Vec<(Section, u64)> = Vec::new();

        for token in text.split_whitespace() {
            let next = match token {
                COMMAND_QUEUE_COMMANDS => Some(Section::CommandQueueCommands),
                OBJECTS => Some(Section::Objects),
                DESCRIPTORS => Some(Section::Descriptors),
                ACCELERATION_STRUCTURES => Some(Section::AccelerationStructures),
                _ => None,
            };
            if let Some(next) = next {
                section = next;
                continue;
            }
            match token.parse::<u64>() {
                Ok(value) => values.push((section, value)),
                Err(_) if token.chars().all(|c| c.is_ascii_uppercase() || c == '_') => {
                    return Err(AnalysisError::UnknownSection(token.to_string()));
                }
                Err(_) => return Err(AnalysisError::InvalidInteger(token.to_string())),
            }
        }

        let mut results = Self {
            loaded: true,
            ..Self::default()
        };
        results.command_lists = section_values(&values, Section::CommandLists)
            .map(ObjectKey)
            .collect();
        results.command_queue_commands = section_values(&values, Section::CommandQueueCommands)
            .map(CommandKey)
            .collect();
        results.objects = section_values(&values, Section::Objects)
            .map(ObjectKey)
            .collect();
        let descriptors = section_values(&values, Section::Descriptors).collect();
        results.descriptors = pairs(descriptors, DESCRIPTORS)?
            .into_iter()
            .map(|(heap, index)| {
                let index = u32::try_from(index)
                    .map_err(|_| AnalysisError::InvalidInteger(index.to_string()))?;
                Ok((ObjectKey(heap), index))
            })
            .collect::<Result<_, AnalysisError>>()?;
        let structures = section_values(&values, Section::AccelerationStructures).collect();
        results.acceleration_structures = pairs(structures, ACCELERATION_STRUCTURES)?
            .into_iter()
            .map(|(key, offset)| KeyOffset::new(ObjectKey(key), offset))
            .collect();
        Ok(results)
    }

    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        let text = std::fs::read_to_string(path).map_err(|source| AnalysisError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let results = Self::parse(&text)?;
        info!(
            path = %path.display(),
            command_lists = results.command_lists.len(),
            command_queue_commands = results.command_queue_commands.len(),
            objects = results.objects.len(),
            descriptors = results.descriptors.len(),
            acceleration_structures = results.acceleration_structures.len(),
            "loaded analysis results"
        );
        Ok(results)
    }

    /// Like [`AnalyzerResults::load`], but a missing file means "restore everything".
    pub fn load_optional(path: &Path) -> Result<Self, AnalysisError> {
        if !path.exists() {
            debug!(path = %path.display(), "no analysis artifact; restoring everything");
            return Ok(Self::absent());
        }
        Self::load(path)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn narrows<T>(&self, set: &BTreeSet<T>) -> bool {
        self.loaded && !set.is_empty()
    }

    pub fn requires_command_list(&self, list: ObjectKey) -> bool {
        !self.narrows(&self.command_lists) || self.command_lists.contains(&list)
    }

    pub fn requires_command_queue_command(&self, command: CommandKey) -> bool {
        !self.narrows(&self.command_queue_commands)
            || self.command_queue_commands.contains(&command)
    }

    pub fn requires_object(&self, object: ObjectKey) -> bool {
        !self.narrows(&self.objects) || self.objects.contains(&object)
    }

    pub fn requires_descriptor(&self, heap: ObjectKey, index: u32) -> bool {
        !self.narrows(&self.descriptors) || self.descriptors.contains(&(heap, index))
    }

    pub fn requires_acceleration_structure(&self, location: KeyOffset) -> bool {
        !self.narrows(&self.acceleration_structures)
            || self.acceleration_structures.contains(&location)
    }

    /// Strict membership, without the "empty means everything" default.
    pub fn lists_acceleration_structure(&self, location: KeyOffset) -> bool {
        self.acceleration_structures.contains(&location)
    }

    pub fn lists_object(&self, object: ObjectKey) -> bool {
        self.objects.contains(&object)
    }

    pub fn lists_command_queue_command(&self, command: CommandKey) -> bool {
        self.command_queue_commands.contains(&command)
    }

    pub fn objects(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.objects.iter().copied()
    }

    pub fn acceleration_structures(&self) -> impl Iterator<Item = KeyOffset> + '_ {
        self.acceleration_structures.iter().copied()
    }
}

fn section_values(values: &[(Section, u64)], wanted: Section) -> impl Iterator<Item = u64> + '_ {
    values
        .iter()
        .filter(move |(section, _)| *section == wanted)
        .map(|(_, value)| *value)
}

fn pairs(values: Vec<u64>, section: &'static str) -> Result<Vec<(u64, u64)>, AnalysisError> {
    if values.len() % 2 != 0 {
        return Err(AnalysisError::UnpairedValue { section });
    }
    Ok(values.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
}

impl fmt::Display for AnalyzerResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for list in &self.command_lists {
            writeln!(f, "{}", list.0)?;
        }
        writeln!(f, "{COMMAND_QUEUE_COMMANDS}")?;
        for command in &self.command_queue_commands {
            writeln!(f, "{}", command.0)?;
        }
        writeln!(f, "{OBJECTS}")?;
        for object in &self.objects {
            writeln!(f, "{}", object.0)?;
        }
        writeln!(f, "{DESCRIPTORS}")?;
        for (heap, index) in &self.descriptors {
            writeln!(f, "{} {}", heap.0, index)?;
        }
        writeln!(f, "{ACCELERATION_STRUCTURES}")?;
        for location in &self.acceleration_structures {
            writeln!(f, "{} {}", location.key.0, location.offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ARTIFACT: &str = "12 15\nCOMMAND_QUEUE_COMMANDS\n1040\nOBJECTS\n3 7\n\
                            DESCRIPTORS\n9 0 9 4\nACCELERATION_STRUCTURES\n42 0\n";

    #[test]
    fn parses_every_section() {
        let results = AnalyzerResults::parse(ARTIFACT).unwrap();

        assert!(results.requires_command_list(ObjectKey(12)));
        assert!(!results.requires_command_list(ObjectKey(13)));
        assert!(results.requires_command_queue_command(CommandKey(1040)));
        assert!(!results.requires_object(ObjectKey(4)));
        assert!(results.requires_descriptor(ObjectKey(9), 4));
        assert!(!results.requires_descriptor(ObjectKey(9), 1));
        assert!(results.lists_acceleration_structure(KeyOffset::new(ObjectKey(42), 0)));
        assert!(!results.requires_acceleration_structure(KeyOffset::new(ObjectKey(42), 256)));
    }

    #[test]
    fn empty_sections_and_absent_artifacts_require_everything() {
        let results = AnalyzerResults::parse("OBJECTS 3").unwrap();
        assert!(results.requires_command_list(ObjectKey(99)));
        assert!(results.requires_acceleration_structure(KeyOffset::new(ObjectKey(1), 0)));
        assert!(!results.lists_acceleration_structure(KeyOffset::new(ObjectKey(1), 0)));

        let absent = AnalyzerResults::absent();
        assert!(!absent.is_loaded());
        assert!(absent.requires_object(ObjectKey(1)));
        assert!(absent.requires_descriptor(ObjectKey(1), 0));
    }

    #[test]
    fn rejects_malformed_artifacts() {
        assert!(matches!(
            AnalyzerResults::parse("DESCRIPTORS 1 2 3"),
            Err(AnalysisError::UnpairedValue {
                section: DESCRIPTORS
            })
        ));
        assert!(matches!(
            AnalyzerResults::parse("TEXTURES 1"),
            Err(AnalysisError::UnknownSection(name)) if name == "TEXTURES"
        ));
        assert!(matches!(
            AnalyzerResults::parse("OBJECTS 1x"),
            Err(AnalysisError::InvalidInteger(_))
        ));
        assert!(matches!(
            AnalyzerResults::parse("DESCRIPTORS 9 4294967296"),
            Err(AnalysisError::InvalidInteger(value)) if value == "4294967296"
        ));
    }

    #[test]
    fn display_renders_a_parseable_artifact() {
        let results = AnalyzerResults::parse(ARTIFACT).unwrap();
        let rendered = results.to_string();
        assert_eq!(AnalyzerResults::parse(&rendered).unwrap(), results);
        assert!(rendered.starts_with("12\n15\nCOMMAND_QUEUE_COMMANDS\n"));
    }

    #[test]
    fn load_optional_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        assert!(!AnalyzerResults::load_optional(&path).unwrap().is_loaded());

        std::fs::write(&path, "ACCELERATION_STRUCTURES\n42 0\n").unwrap();
        let results = AnalyzerResults::load_optional(&path).unwrap();
        assert!(results.is_loaded());
        assert!(results.lists_acceleration_structure(KeyOffset::new(ObjectKey(42), 0)));
    }
}
