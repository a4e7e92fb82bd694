//! Language registry.
//!
//! Maps a `Language` to the runtime template used to materialize a runnable
//! artifact. Nothing outside this module branches on language names.

use std::str::FromStr;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Languages the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::Javascript];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
        }
    }

    /// Template shipped with the engine for this language.
    pub fn default_template(&self) -> Template {
        match self {
            Language::Python => Template {
                base_image: "python:3.12-alpine".to_string(),
                file_extension: "py".to_string(),
                command: vec!["python".to_string(), "-u".to_string()],
            },
            Language::Javascript => Template {
                base_image: "node:20-alpine".to_string(),
                file_extension: "js".to_string(),
                command: vec!["node".to_string()],
            },
        }
    }

    /// Guess the language from a source file extension.
    pub fn from_extension(ext: &str) -> Option<Language> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "py" => Some(Language::Python),
            "js" | "mjs" | "cjs" => Some(Language::Javascript),
            _ => None,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            other => Err(Error::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Runtime template for one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Base image the artifact is built from.
    pub base_image: String,
    /// Extension of the source file, without the dot.
    pub file_extension: String,
    /// Interpreter argv; the source path is appended.
    pub command: Vec<String>,
}

/// Directory inside the artifact that holds the submitted source.
pub const APP_DIR: &str = "/app";

impl Template {
    /// File name of the submitted source inside the build context.
    pub fn source_file_name(&self) -> String {
        format!("function.{}", self.file_extension)
    }

    /// Render the Dockerfile for this template.
    ///
    /// The code runs as an unprivileged user and the interpreter is the
    /// container's entrypoint, so `docker run <image>` executes the function.
    pub fn dockerfile(&self) -> String {
        let source = self.source_file_name();
        let mut argv: Vec<String> = self.command.clone();
        argv.push(format!("{APP_DIR}/{source}"));
        let cmd = argv
            .iter()
            .map(|a| format!("{a:?}"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "FROM {image}\n\
             WORKDIR {APP_DIR}\n\
             COPY {source} {APP_DIR}/{source}\n\
             USER nobody\n\
             CMD [{cmd}]\n",
            image = self.base_image,
        )
    }
}

/// Registry of runtime templates, keyed by language.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    templates: FxHashMap<Language, Template>,
}

impl LanguageRegistry {
    /// Registry with the built-in template for every language.
    pub fn with_defaults() -> Self {
        let templates = Language::ALL
            .iter()
            .map(|lang| (*lang, lang.default_template()))
            .collect();
        Self { templates }
    }

    /// Registry with no templates; languages must be registered explicitly.
    pub fn empty() -> Self {
        Self {
            templates: FxHashMap::default(),
        }
    }

    /// Register (or replace) the template for a language.
    pub fn register(&mut self, language: Language, template: Template) {
        self.templates.insert(language, template);
    }

    /// Parse a language name, failing with `UnsupportedLanguage` if it is
    /// unknown or has no registered template.
    pub fn language(&self, name: &str) -> Result<Language> {
        let language: Language = name.parse()?;
        if self.templates.contains_key(&language) {
            Ok(language)
        } else {
            Err(Error::UnsupportedLanguage(name.to_string()))
        }
    }

    /// Resolve the template for a language.
    pub fn resolve(&self, language: Language) -> Result<&Template> {
        self.templates
            .get(&language)
            .ok_or_else(|| Error::UnsupportedLanguage(language.to_string()))
    }

    /// Registered languages, sorted.
    pub fn languages(&self) -> Vec<Language> {
        let mut langs: Vec<Language> = self.templates.keys().copied().collect();
        langs.sort();
        langs
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
