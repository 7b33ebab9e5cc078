//! cloud-config document builder
//!
//! Produces the `#cloud-config` user data every VM boots with. Sections that
//! are empty are left out of the document entirely.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::{Error, Result};

const HEADER: &str = "#cloud-config\n";
const SUDO_ALL: &str = "ALL=(ALL) NOPASSWD:ALL";
const LOGIN_SHELL: &str = "/bin/bash";

/// A file written by cloud-init before `runcmd`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WriteFile {
    /// Absolute path inside the guest
    pub path: String,
    /// File content
    pub content: String,
    /// Octal permissions, e.g. `0644`
    pub permissions: String,
}

/// Login created inside every VM
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SshCredentials {
    /// User name; no user block is emitted when empty
    pub user: String,
    /// Plain-text password; enables password SSH when set
    pub password: Option<String>,
    /// Authorized public keys
    pub authorized_keys: Vec<String>,
}

#[derive(Serialize)]
struct UserEntry<'a> {
    name: &'a str,
    sudo: &'static str,
    shell: &'static str,
    lock_passwd: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    plain_text_passwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssh_authorized_keys: Option<&'a [String]>,
}

/// Builder for a cloud-config document
#[derive(Clone, Debug, Default)]
pub struct CloudConfig {
    packages: Vec<String>,
    write_files: Vec<WriteFile>,
    runcmd: Vec<Vec<String>>,
    extra: BTreeMap<String, Value>,
}

impl CloudConfig {
    /// Empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a package
    pub fn package(mut self, name: &str) -> Self {
        self.packages.push(name.to_string());
        self
    }

    /// Write a file
    pub fn write_file(mut self, path: &str, content: impl Into<String>, permissions: &str) -> Self {
        self.write_files.push(WriteFile {
            path: path.to_string(),
            content: content.into(),
            permissions: permissions.to_string(),
        });
        self
    }

    /// Run a command (argv form) on first boot
    pub fn run(mut self, argv: &[&str]) -> Self {
        self.runcmd
            .push(argv.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Set an arbitrary top-level key; overrides any generated section
    pub fn extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Packages to install
    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// Files to write
    pub fn files(&self) -> &[WriteFile] {
        &self.write_files
    }

    /// Render the document with the given login
    pub fn render(&self, ssh: &SshCredentials) -> Result<String> {
        let mut doc = Mapping::new();

        if !self.packages.is_empty() {
            doc.insert("packages".into(), to_value(&self.packages)?);
        }
        if !self.write_files.is_empty() {
            doc.insert("write_files".into(), to_value(&self.write_files)?);
        }
        if !self.runcmd.is_empty() {
            doc.insert("runcmd".into(), to_value(&self.runcmd)?);
        }

        if !ssh.user.is_empty() {
            let password = ssh.password.as_deref().filter(|p| !p.is_empty());
            let user = UserEntry {
                name: &ssh.user,
                sudo: SUDO_ALL,
                shell: LOGIN_SHELL,
                lock_passwd: password.is_none(),
                plain_text_passwd: password,
                ssh_authorized_keys: Some(ssh.authorized_keys.as_slice())
                    .filter(|keys| !keys.is_empty()),
            };
            doc.insert("users".into(), to_value(&[user])?);
            if password.is_some() {
                doc.insert("ssh_pwauth".into(), Value::Bool(true));
            }
        }

        for (key, value) in &self.extra {
            doc.insert(key.as_str().into(), value.clone());
        }

        if doc.is_empty() {
            return Ok(HEADER.to_string());
        }

        let body = serde_yaml::to_string(&doc).map_err(|e| Error::serialization(e.to_string()))?;
        Ok(format!("{}{}", HEADER, body))
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_yaml::to_value(value).map_err(|e| Error::serialization(e.to_string()))
}
