//! dbvcs - command-line front end
//!
//! Records database file uploads in a git-backed store and manages their
//! branches and merges.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing::debug;

use dbvcs::engine::{
    AuthorSpec, ConfigError, Engine, EngineConfig, EngineError, MergeRequest, NewCommit, StaticIdentityResolver,
    UserIdentity,
};
use dbvcs::logging::{self, LoggingConfig, LoggingError};
use dbvcs::storage::{
    BranchName, CommitId, DatabaseId, GitBackend, InvalidDigestError, InvalidNameError, Signature, StorageError,
};

/// username merges are attributed to when run from the command line
const CLI_USER: &str = "cli";

#[derive(Debug, Parser)]
#[command(name = "dbvcs", version, about = "Version control for hosted database files")]
struct Cli {
    /// Path of the git-backed store, created if missing
    #[arg(short, long, default_value = ".dbvcs", global = true)]
    repo: PathBuf,

    /// Engine configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(flatten)]
    author: AuthorArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct AuthorArgs {
    /// Author name for new commits
    #[arg(long, global = true)]
    author_name: Option<String>,

    /// Author email for new commits
    #[arg(long, global = true)]
    author_email: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a database from its first upload
    Init { owner: String, name: String, file: PathBuf },
    /// Record a new upload on a branch
    Commit {
        owner: String,
        name: String,
        branch: String,
        file: PathBuf,
        /// Commit message
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Create a branch at an existing commit
    Branch {
        owner: String,
        name: String,
        new: String,
        /// Commit id (hex) the branch starts at
        from: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Show a branch's first-parent history
    Log { owner: String, name: String, branch: String },
    /// List branches; the default branch is marked with `*`
    Branches { owner: String, name: String },
    /// Delete a branch other than the default
    DeleteBranch { owner: String, name: String, branch: String },
    /// Show the default branch, or set it when a branch is given
    DefaultBranch {
        owner: String,
        name: String,
        branch: Option<String>,
    },
    /// Replace a branch's description
    Describe {
        owner: String,
        name: String,
        branch: String,
        description: String,
    },
    /// Fast-forward merge one branch into another
    Merge {
        owner: String,
        name: String,
        source: String,
        destination: String,
        #[arg(short, long)]
        message: Option<String>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error("{0}")]
    Usage(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<StorageError> for CliError {
    fn from(e: StorageError) -> Self {
        CliError::Engine(e.into())
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Engine(e.into())
    }
}

impl From<InvalidNameError> for CliError {
    fn from(e: InvalidNameError) -> Self {
        CliError::Engine(e.into())
    }
}

impl From<InvalidDigestError> for CliError {
    fn from(e: InvalidDigestError) -> Self {
        CliError::Engine(e.into())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let log_config = LoggingConfig {
        level: level.to_string(),
        json: cli.log_json,
    };
    if let Err(e) = logging::init(&log_config) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let backend = GitBackend::open_or_init(&cli.repo)?;
    debug!(path = %backend.path().display(), "opened store");

    let identities = StaticIdentityResolver::new();
    if let Some(author) = cli.author.signature() {
        identities.insert(CLI_USER, UserIdentity::new(author.name, author.email));
    }
    let engine = Engine::builder()
        .config(config)
        .git_backend(backend)
        .identity_resolver(Arc::new(identities))
        .build()?;

    match cli.command {
        Command::Init { owner, name, file } => {
            let db = DatabaseId::new(owner, name)?;
            let upload = upload(cli.author.require()?, &file)?;
            let id = engine.create_database(&db, upload)?;
            println!("created {} on {} at {}", db, engine.default_branch(&db)?, id.short());
        }
        Command::Commit {
            owner,
            name,
            branch,
            file,
            message,
        } => {
            let db = DatabaseId::new(owner, name)?;
            let branch = BranchName::new(branch)?;
            let mut upload = upload(cli.author.require()?, &file)?;
            if let Some(message) = message {
                upload = upload.message(message);
            }
            let id = engine.commit(&db, &branch, upload)?;
            println!("{} {}", branch, id.short());
        }
        Command::Branch {
            owner,
            name,
            new,
            from,
            description,
        } => {
            let db = DatabaseId::new(owner, name)?;
            let new = BranchName::new(new)?;
            let from = CommitId::from_hex(&from)?;
            let branch = engine.create_branch(&db, &new, from, &description)?;
            println!("{} {} ({} commits)", new, branch.head.short(), branch.commit_count);
        }
        Command::Log { owner, name, branch } => {
            let db = DatabaseId::new(owner, name)?;
            let branch = BranchName::new(branch)?;
            for commit in engine.history(&db, &branch)? {
                let marker = if commit.is_merge() { " (merge)" } else { "" };
                println!(
                    "{} {} {} <{}> {}{}",
                    commit.id.short(),
                    commit.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    commit.author_name,
                    commit.author_email,
                    commit.summary(),
                    marker
                );
            }
        }
        Command::Branches { owner, name } => {
            let db = DatabaseId::new(owner, name)?;
            let branches = engine.branches(&db)?;
            if branches.is_empty() {
                return Err(CliError::Usage(format!("no database named {}", db)));
            }
            let default_branch = engine.default_branch(&db)?;
            for (name, branch) in branches.iter() {
                let marker = if *name == default_branch { "*" } else { " " };
                println!("{} {} {} {}", marker, name, branch.head.short(), branch.commit_count);
            }
        }
        Command::DeleteBranch { owner, name, branch } => {
            let db = DatabaseId::new(owner, name)?;
            let branch = BranchName::new(branch)?;
            let removed = engine.delete_branch(&db, &branch)?;
            println!("deleted {} (was at {})", branch, removed.head.short());
        }
        Command::DefaultBranch { owner, name, branch } => {
            let db = DatabaseId::new(owner, name)?;
            if let Some(branch) = branch {
                engine.set_default_branch(&db, &BranchName::new(branch)?)?;
            }
            println!("{}", engine.default_branch(&db)?);
        }
        Command::Describe {
            owner,
            name,
            branch,
            description,
        } => {
            let db = DatabaseId::new(owner, name)?;
            let branch = BranchName::new(branch)?;
            engine.update_branch_description(&db, &branch, &description)?;
            println!("{}: {}", branch, description);
        }
        Command::Merge {
            owner,
            name,
            source,
            destination,
            message,
        } => {
            cli.author.require()?;
            let db = DatabaseId::new(owner, name)?;
            let source = BranchName::new(source)?;
            let destination = BranchName::new(destination)?;

            let dest_head = engine.branch(&db, &destination)?.head;
            let commits = engine.commits_since(&db, &source, dest_head)?;
            if commits.is_empty() {
                println!("{} has nothing new for {}", source, destination);
                return Ok(());
            }
            let count = commits.len();
            let message = message.unwrap_or_else(|| format!("Merge {} into {}", source, destination));
            let request = MergeRequest::new(destination.clone(), commits, CLI_USER).message(message);
            let id = engine.merge_with_retry(&db, request)?;
            println!("merged {} commits from {} into {} at {}", count, source, destination, id.short());
        }
    }
    Ok(())
}

impl AuthorArgs {
    fn signature(&self) -> Option<Signature> {
        match (&self.author_name, &self.author_email) {
            (Some(name), Some(email)) => Some(Signature::new(name.clone(), email.clone())),
            _ => None,
        }
    }

    fn require(&self) -> Result<AuthorSpec, CliError> {
        self.signature()
            .map(AuthorSpec::Explicit)
            .ok_or_else(|| CliError::Usage("this command needs --author-name and --author-email".to_string()))
    }
}

/// An upload of one file, named after its basename.
fn upload(author: AuthorSpec, path: &Path) -> Result<NewCommit, CliError> {
    let read_err = |source| CliError::Read {
        path: path.to_path_buf(),
        source,
    };
    let bytes = std::fs::read(path).map_err(read_err)?;
    let modified: DateTime<Utc> = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::from)
        .map_err(read_err)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CliError::Usage(format!("{} has no usable file name", path.display())))?;
    Ok(NewCommit::new(author).file(name, bytes, modified))
}
