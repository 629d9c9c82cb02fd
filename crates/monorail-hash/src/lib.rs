#![deny(clippy::all)]

//! Fingerprint derivation for monorail tasks.
//!
//! A fingerprint is the cache key for one logical task execution. It folds in
//! everything that can change a task's output: the task and package identity,
//! the content hashes of its input files, the fingerprints of its
//! dependencies, its definition, the repo-global fingerprint, and the
//! environment it resolves. Two runs that agree on every input produce
//! byte-identical fingerprints on any host.
//!
//! Task and global fingerprints use xxh64 over a canonical byte encoding;
//! individual file contents use git's blob hashing (see [`blob`]).

mod blob;
mod canonical;

use std::collections::HashMap;

pub use blob::{git_blob_hash, git_blob_hash_file, hash_files, Error};
use canonical::{hex_encode_u64, CanonicalDigest};
use monorail_env::EnvironmentVariablePairs;
use monorail_paths::RelativeUnixPathBuf;
use serde::{Deserialize, Serialize};

/// Anything that can be reduced to a fingerprint.
pub trait MonorailHash {
    fn hash(&self) -> String;
}

fn finish(digest: CanonicalDigest) -> String {
    let mut hex_buf = [0u8; 16];
    hex_encode_u64(digest.finish(), &mut hex_buf).to_owned()
}

/// Glob lists naming the files a task produces.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

/// How the environment is presented to a task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvMode {
    #[default]
    Infer,
    Loose,
    Strict,
}

impl std::fmt::Display for EnvMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EnvMode::Infer => "infer",
            EnvMode::Loose => "loose",
            EnvMode::Strict => "strict",
        })
    }
}

/// How much of a replayed task's output log is shown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    #[default]
    Full,
    None,
    HashOnly,
    NewOnly,
    ErrorsOnly,
}

impl OutputLogsMode {
    fn as_str(&self) -> &'static str {
        match self {
            OutputLogsMode::Full => "full",
            OutputLogsMode::None => "none",
            OutputLogsMode::HashOnly => "hash-only",
            OutputLogsMode::NewOnly => "new-only",
            OutputLogsMode::ErrorsOnly => "errors-only",
        }
    }
}

/// The sorted map of anchor-relative input file → content hash for one
/// package-task, reduced to a single fingerprint before entering
/// [`TaskHashable`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileHashes(pub HashMap<RelativeUnixPathBuf, String>);

impl MonorailHash for FileHashes {
    fn hash(&self) -> String {
        let mut digest = CanonicalDigest::new();
        digest.write_map(self.0.iter());
        finish(digest)
    }
}

/// Everything that identifies one logical execution of a task within a
/// package. Field order is part of the format; do not reorder.
#[derive(Debug, Clone)]
pub struct TaskHashable<'a> {
    pub task: &'a str,
    pub package_dir: Option<RelativeUnixPathBuf>,
    pub hash_of_files: &'a str,
    pub external_deps_hash: Option<String>,
    pub task_dependency_hashes: Vec<String>,
    pub pass_through_args: &'a [String],

    // The task definition, as far as it affects outputs.
    pub outputs: TaskOutputs,
    pub env: &'a [String],
    pub inputs: &'a [String],
    pub output_logs: OutputLogsMode,
    pub cache: bool,

    pub global_hash: &'a str,
    pub resolved_env_vars: EnvironmentVariablePairs,
    pub env_mode: EnvMode,
    pub dot_env: &'a [RelativeUnixPathBuf],
}

impl MonorailHash for TaskHashable<'_> {
    fn hash(&self) -> String {
        let mut digest = CanonicalDigest::new();

        digest.write_str(self.task);
        digest.write_opt_str(self.package_dir.as_ref());
        digest.write_str(self.hash_of_files);
        digest.write_opt_str(self.external_deps_hash.as_deref());

        let mut task_dependency_hashes = self.task_dependency_hashes.clone();
        task_dependency_hashes.sort();
        digest.write_seq(task_dependency_hashes.iter());

        digest.write_seq(self.pass_through_args.iter());

        digest.write_seq(self.outputs.inclusions.iter());
        digest.write_seq(self.outputs.exclusions.iter());
        let mut env = self.env.to_vec();
        env.sort();
        digest.write_seq(env.iter());
        digest.write_seq(self.inputs.iter());
        digest.write_str(self.output_logs.as_str());
        digest.write_bool(self.cache);

        digest.write_str(self.global_hash);
        digest.write_seq(self.resolved_env_vars.iter());
        digest.write_str(self.env_mode.to_string());
        digest.write_seq(self.dot_env.iter());

        finish(digest)
    }
}

/// Repo-wide state folded into every task fingerprint.
#[derive(Debug, Clone)]
pub struct GlobalHashable<'a> {
    pub global_cache_key: &'a str,
    pub global_file_hash_map: &'a HashMap<RelativeUnixPathBuf, String>,
    pub root_external_dependencies_hash: Option<&'a str>,
    pub env: &'a [String],
    pub resolved_env_vars: EnvironmentVariablePairs,
    pub pass_through_env: &'a [String],
    pub env_mode: EnvMode,
    pub framework_inference: bool,
}

impl MonorailHash for GlobalHashable<'_> {
    fn hash(&self) -> String {
        let mut digest = CanonicalDigest::new();

        digest.write_str(self.global_cache_key);
        digest.write_map(self.global_file_hash_map.iter());
        digest.write_opt_str(self.root_external_dependencies_hash);

        let mut env = self.env.to_vec();
        env.sort();
        digest.write_seq(env.iter());
        digest.write_seq(self.resolved_env_vars.iter());
        digest.write_seq(self.pass_through_env.iter());
        digest.write_str(self.env_mode.to_string());
        digest.write_bool(self.framework_inference);

        finish(digest)
    }
}
