//! Declarative per-language profiles.
//!
//! Commands are argv arrays assembled from [`Arg`] placeholders against a
//! [`ScratchLayout`]; nothing here ever goes through a shell.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use arbiter_common::{Config, Language};

use crate::error::{JudgeError, Result};

/// Largest accepted source file
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;

const BINARY_NAME: &str = "main";
const INPUT_NAME: &str = "input.txt";

/// Where things live inside a sandbox's scratch area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchLayout {
    pub workdir: PathBuf,
    pub source_file: String,
}

impl ScratchLayout {
    pub fn new(workdir: impl Into<PathBuf>, source_file: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            source_file: source_file.into(),
        }
    }

    pub fn source(&self) -> PathBuf {
        self.workdir.join(&self.source_file)
    }

    pub fn binary(&self) -> PathBuf {
        self.workdir.join(BINARY_NAME)
    }

    pub fn input(&self) -> PathBuf {
        self.workdir.join(INPUT_NAME)
    }

    pub fn input_name() -> &'static str {
        INPUT_NAME
    }

    pub fn binary_name() -> &'static str {
        BINARY_NAME
    }
}

/// One argv element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Literal(String),
    Source,
    Binary,
    Input,
    Workdir,
}

impl Arg {
    pub fn lit(value: &str) -> Self {
        Arg::Literal(value.to_string())
    }

    fn render(&self, layout: &ScratchLayout) -> String {
        match self {
            Arg::Literal(value) => value.clone(),
            Arg::Source => path_arg(&layout.source()),
            Arg::Binary => path_arg(&layout.binary()),
            Arg::Input => path_arg(&layout.input()),
            Arg::Workdir => path_arg(&layout.workdir),
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Program plus arguments, first element is the program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub argv: Vec<Arg>,
}

impl CommandTemplate {
    pub fn new(argv: Vec<Arg>) -> Self {
        Self { argv }
    }

    pub fn build(&self, layout: &ScratchLayout) -> Vec<String> {
        self.argv.iter().map(|arg| arg.render(layout)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub language: Language,
    pub image: String,
    pub source_file: String,
    pub extensions: Vec<String>,
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
}

impl LanguageProfile {
    pub fn python(image: impl Into<String>) -> Self {
        Self {
            language: Language::Python,
            image: image.into(),
            source_file: "main.py".to_string(),
            extensions: vec![".py".to_string()],
            compile: None,
            run: CommandTemplate::new(vec![Arg::lit("python3"), Arg::Source]),
        }
    }

    pub fn cpp(image: impl Into<String>) -> Self {
        Self {
            language: Language::Cpp,
            image: image.into(),
            source_file: "main.cpp".to_string(),
            extensions: [".cpp", ".cc", ".cxx", ".c++"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            compile: Some(CommandTemplate::new(vec![
                Arg::lit("g++"),
                Arg::lit("-O2"),
                Arg::lit("-std=c++17"),
                Arg::lit("-o"),
                Arg::Binary,
                Arg::Source,
            ])),
            run: CommandTemplate::new(vec![Arg::Binary]),
        }
    }

    pub fn layout(&self, workdir: impl Into<PathBuf>) -> ScratchLayout {
        ScratchLayout::new(workdir, self.source_file.clone())
    }

    /// Upload checks carried over to the core: size, emptiness, extension
    pub fn validate_source(&self, filename: Option<&str>, content: &[u8]) -> Result<()> {
        if content.len() > MAX_SOURCE_BYTES {
            return Err(JudgeError::InvalidSource(
                "code file too large (max 1MB)".to_string(),
            ));
        }
        if content.is_empty() {
            return Err(JudgeError::InvalidSource("code file is empty".to_string()));
        }
        if String::from_utf8_lossy(content).trim().is_empty() {
            return Err(JudgeError::InvalidSource(
                "code file contains no content".to_string(),
            ));
        }
        if let Some(name) = filename {
            let lower = name.to_lowercase();
            if !self.extensions.iter().any(|ext| lower.ends_with(ext.as_str())) {
                return Err(JudgeError::InvalidSource(format!(
                    "invalid file extension for {}. Expected: {}",
                    self.language,
                    self.extensions.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Typed lookup table from language to profile
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl LanguageRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self::empty()
            .with_profile(LanguageProfile::python(config.image_python.clone()))
            .with_profile(LanguageProfile::cpp(config.image_cpp.clone()))
    }

    pub fn empty() -> Self {
        Self {
            profiles: HashMap::new(),
        }
    }

    /// Registers or replaces the profile for its language
    pub fn with_profile(mut self, profile: LanguageProfile) -> Self {
        self.profiles.insert(profile.language, profile);
        self
    }

    pub fn get(&self, language: Language) -> Result<&LanguageProfile> {
        self.profiles
            .get(&language)
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    /// Parses a language name and checks a profile exists for it
    pub fn resolve(&self, name: &str) -> Result<Language> {
        let language: Language = name
            .parse()
            .map_err(|_| JudgeError::UnsupportedLanguage(name.to_string()))?;
        self.get(language)?;
        Ok(language)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        let mut profiles: Vec<_> = self.profiles.values().collect();
        profiles.sort_by_key(|p| p.language.to_string());
        profiles.into_iter()
    }
}
