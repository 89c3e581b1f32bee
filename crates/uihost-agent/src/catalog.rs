use std::path::{Path, PathBuf};

use anyhow::Context;
use uihost_types::UiKind;

/// Placeholder in `start_command` replaced by the installation's environment interpreter.
pub const PYTHON_PLACEHOLDER: &str = "{python}";

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct UiKindSpec {
    pub kind: String,
    pub display_name: String,
    pub source_url: String,
    /// Dependency manifest inside the cloned repository.
    pub manifest_file: String,
    pub start_command: Vec<String>,
    #[serde(default)]
    pub extra_packages: Vec<String>,
}

impl UiKindSpec {
    pub fn ui_kind(&self) -> UiKind {
        UiKind(self.kind.clone())
    }

    /// Splits the start command into program and args, substituting the interpreter placeholder.
    pub fn resolve_start_command(
        &self,
        interpreter: &Path,
    ) -> anyhow::Result<(PathBuf, Vec<String>)> {
        let Some((program, args)) = self.start_command.split_first() else {
            anyhow::bail!("kind {} has an empty start_command", self.kind);
        };
        let program = if program == PYTHON_PLACEHOLDER {
            interpreter.to_path_buf()
        } else {
            PathBuf::from(program)
        };
        Ok((program, args.to_vec()))
    }
}

#[derive(Debug, serde::Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "kind")]
    kinds: Vec<UiKindSpec>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    kinds: Vec<UiKindSpec>,
}

fn builtin_kinds() -> Vec<UiKindSpec> {
    vec![
        UiKindSpec {
            kind: "comfyui".to_string(),
            display_name: "ComfyUI".to_string(),
            source_url: "https://github.com/comfyanonymous/ComfyUI.git".to_string(),
            manifest_file: "requirements.txt".to_string(),
            start_command: vec![
                PYTHON_PLACEHOLDER.to_string(),
                "main.py".to_string(),
                "--listen".to_string(),
                "127.0.0.1".to_string(),
            ],
            extra_packages: Vec::new(),
        },
        UiKindSpec {
            kind: "automatic1111".to_string(),
            display_name: "Stable Diffusion WebUI".to_string(),
            source_url: "https://github.com/AUTOMATIC1111/stable-diffusion-webui.git".to_string(),
            manifest_file: "requirements_versions.txt".to_string(),
            start_command: vec![
                PYTHON_PLACEHOLDER.to_string(),
                "launch.py".to_string(),
                "--skip-prepare-environment".to_string(),
            ],
            extra_packages: vec!["torch".to_string(), "torchvision".to_string()],
        },
        UiKindSpec {
            kind: "fooocus".to_string(),
            display_name: "Fooocus".to_string(),
            source_url: "https://github.com/lllyasviel/Fooocus.git".to_string(),
            manifest_file: "requirements_versions.txt".to_string(),
            start_command: vec![PYTHON_PLACEHOLDER.to_string(), "launch.py".to_string()],
            extra_packages: Vec::new(),
        },
    ]
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            kinds: builtin_kinds(),
        }
    }
}

impl Catalog {
    pub fn new(kinds: Vec<UiKindSpec>) -> Self {
        Self { kinds }
    }

    /// Built-in kinds, with entries from `path` (if any) added or replacing by `kind`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut catalog = Self::default();
        let Some(path) = path else {
            return Ok(catalog);
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read catalog {}", path.display()))?;
        catalog
            .merge_toml(&raw)
            .with_context(|| format!("parse catalog {}", path.display()))?;
        Ok(catalog)
    }

    fn merge_toml(&mut self, raw: &str) -> anyhow::Result<()> {
        let file: CatalogFile = toml::from_str(raw)?;
        for spec in file.kinds {
            if spec.start_command.is_empty() {
                anyhow::bail!("kind {} has an empty start_command", spec.kind);
            }
            match self.kinds.iter_mut().find(|k| k.kind == spec.kind) {
                Some(existing) => *existing = spec,
                None => self.kinds.push(spec),
            }
        }
        Ok(())
    }

    pub fn list(&self) -> &[UiKindSpec] {
        &self.kinds
    }

    pub fn find(&self, kind: &str) -> Option<&UiKindSpec> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}
