use std::sync::{Arc, OnceLock};

use subst::Env;
use tempfile::{tempdir, TempDir};

use crate::VolatileTokens;

/// Substitutes variables in SQL once `control substitution on` is seen:
/// `$__TEST_DIR__`, `$__NOW__`, volatile token symbols such as `$WORKSPACE_ROOT`, and
/// environment variables, in that order of precedence.
#[derive(Default, Clone)]
pub(crate) struct Substitution {
    /// The temporary directory for `__TEST_DIR__`.
    /// Lazily initialized and cleaned up when dropped.
    test_dir: Arc<OnceLock<TempDir>>,
    tokens: Arc<VolatileTokens>,
}

#[derive(thiserror::Error, Debug)]
#[error("substitution failed: {0}")]
pub(crate) struct SubstError(subst::Error);

impl Substitution {
    pub fn new(tokens: Arc<VolatileTokens>) -> Self {
        Self {
            test_dir: Default::default(),
            tokens,
        }
    }

    pub fn substitute(&self, input: &str) -> Result<String, SubstError> {
        subst::substitute(input, self).map_err(SubstError)
    }

    fn test_dir(&self) -> Option<String> {
        if self.test_dir.get().is_none() {
            let dir = tempdir().ok()?;
            // a concurrent initialization wins, and `dir` is removed on drop
            let _ = self.test_dir.set(dir);
        }
        let dir = self.test_dir.get()?;
        Some(dir.path().to_string_lossy().into_owned())
    }

    fn now(&self) -> String {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
            .to_string()
    }
}

impl<'a> subst::VariableMap<'a> for Substitution {
    type Value = String;

    fn get(&'a self, key: &str) -> Option<Self::Value> {
        match key {
            "__TEST_DIR__" => self.test_dir(),
            "__NOW__" => self.now().into(),
            key => self
                .tokens
                .get(key)
                .map(str::to_string)
                .or_else(|| Env.get(key)),
        }
    }
}
