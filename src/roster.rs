use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Persisted identity of the active fleet: who owns it, which credential and
/// zone it was raised under, and the provider ids of its members.
///
/// At most one roster exists per store path. A roster with no member ids is
/// the same thing as "no fleet" and is never written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub owner_username: String,
    pub credential_key_name: String,
    pub zone: String,
    pub member_ids: Vec<String>,
}

impl Roster {
    pub fn identity_matches(&self, owner_username: &str, credential_key_name: &str, zone: &str) -> bool {
        self.owner_username == owner_username
            && self.credential_key_name == credential_key_name
            && self.zone == zone
    }
}

#[derive(Debug)]
pub enum RosterError {
    Io(io::Error),
    Corrupt { path: PathBuf, reason: String },
    EmptyMembership,
}

impl std::fmt::Display for RosterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "roster io error: {e}"),
            Self::Corrupt { path, reason } => {
                write!(f, "corrupt roster at {}: {reason}", path.display())
            }
            Self::EmptyMembership => {
                write!(f, "refusing to persist a roster with no members")
            }
        }
    }
}

impl std::error::Error for RosterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Corrupt { .. } | Self::EmptyMembership => None,
        }
    }
}

impl From<io::Error> for RosterError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Line-oriented roster file: owner username, credential key name, zone, then
/// one member instance id per line. Blank member lines are ignored.
#[derive(Debug, Clone)]
pub struct RosterStore {
    path: PathBuf,
}

impl RosterStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absence of the file means "no active fleet". A file that exists but is
    /// missing a header line is reported as corrupt, never silently dropped.
    pub fn load(&self) -> Result<Option<Roster>, RosterError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut lines = text.lines();
        let owner_username = self.header_line(&mut lines, "owner username")?;
        let credential_key_name = self.header_line(&mut lines, "credential key name")?;
        let zone = self.header_line(&mut lines, "zone")?;
        let member_ids = lines
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();

        Ok(Some(Roster {
            owner_username,
            credential_key_name,
            zone,
            member_ids,
        }))
    }

    /// Overwrites any prior roster atomically. No partial-write state is ever
    /// visible at `path`.
    pub fn save(&self, roster: &Roster) -> Result<(), RosterError> {
        if roster.member_ids.is_empty() {
            return Err(RosterError::EmptyMembership);
        }

        let mut text = String::new();
        text.push_str(&roster.owner_username);
        text.push('\n');
        text.push_str(&roster.credential_key_name);
        text.push('\n');
        text.push_str(&roster.zone);
        text.push('\n');
        for id in &roster.member_ids {
            text.push_str(id);
            text.push('\n');
        }

        write_atomic(&self.path, text.as_bytes())?;
        Ok(())
    }

    /// Clearing an absent roster is not an error.
    pub fn clear(&self) -> Result<(), RosterError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn header_line(&self, lines: &mut std::str::Lines<'_>, field: &str) -> Result<String, RosterError> {
        let Some(line) = lines.next() else {
            return Err(RosterError::Corrupt {
                path: self.path.clone(),
                reason: format!("missing {field} line"),
            });
        };
        let value = line.trim();
        if value.is_empty() {
            return Err(RosterError::Corrupt {
                path: self.path.clone(),
                reason: format!("{field} is empty"),
            });
        }
        Ok(value.to_string())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        let _ = file.sync_all();
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
