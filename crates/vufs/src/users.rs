//! The virtual user and group registry.
//!
//! Identities are scoped to this server only and come from a text file at
//! `<root>/adm/users`, one record per line: `id:name:group,group,...`.
//! Lines starting with `#` and blank lines are ignored. A user is a group
//! with one member, so groups share the user namespace.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::io_err;
use crate::utils::Result;

/// Location of the user database, relative to the export root.
pub const USERS_FILE: &str = "adm/users";

/// Contents written when no user database exists yet.
const INITIAL_USERS: &str = "1:adm:\n2:mark:\n";

/// A virtual user; also a group when other users list it in their
/// membership column.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vuser {
    /// An integer used to represent this user in on-disk structures.
    /// This should never change.
    id: u32,
    /// The string used to represent this user in the 9P protocol.
    name: String,
    /// Names of the groups this user is part of.
    groups: Vec<String>,
    /// Names of the members of this group.
    members: Vec<String>,
}

impl Vuser {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}

/// The registry, populated once at startup and read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct Vusers {
    name_to_user: HashMap<String, Vuser>,
    id_to_name: HashMap<u32, String>,
}

impl Vusers {
    /// Load the registry from `<root>/adm/users`, creating the file with
    /// a default `adm` and `mark` user when it does not exist.
    pub async fn load(root: impl AsRef<Path>) -> Result<Vusers> {
        let path = root.as_ref().join(USERS_FILE);
        let data = read_users_file(&path).await?;
        Vusers::parse(&data)
    }

    /// Parse the registry from the user file contents.
    pub fn parse(data: &str) -> Result<Vusers> {
        let mut name_to_user: HashMap<String, Vuser> = HashMap::new();

        // First pass: one user record per line.
        for (idx, line) in records(data) {
            let columns: Vec<&str> = line.split(':').collect();
            if columns.len() != 3 {
                return Err(io_err!(
                    InvalidData,
                    format!(
                        "got {} columns (expected 3) on line {} of users file",
                        columns.len(),
                        idx
                    )
                )
                .into());
            }

            let id: u32 = columns[0].parse().map_err(|_| {
                io_err!(
                    InvalidData,
                    format!(
                        "can't parse first column as integer on line {} of users file",
                        idx
                    )
                )
            })?;
            let name = columns[1].to_owned();

            name_to_user.insert(
                name.clone(),
                Vuser {
                    id,
                    name,
                    groups: Vec::new(),
                    members: Vec::new(),
                },
            );
        }

        // Second pass: wire group memberships by name.
        for (idx, line) in records(data) {
            let columns: Vec<&str> = line.split(':').collect();
            let name = columns[1];

            for group_name in columns[2].split(',') {
                if group_name.is_empty() {
                    continue;
                }
                if !name_to_user.contains_key(group_name) {
                    return Err(io_err!(
                        InvalidData,
                        format!("unknown group '{}' on line {} of users file", group_name, idx)
                    )
                    .into());
                }

                if let Some(user) = name_to_user.get_mut(name) {
                    user.groups.push(group_name.to_owned());
                }
                if let Some(group) = name_to_user.get_mut(group_name) {
                    group.members.push(name.to_owned());
                }
            }
        }

        let id_to_name = name_to_user
            .values()
            .map(|u| (u.id, u.name.clone()))
            .collect();

        Ok(Vusers {
            name_to_user,
            id_to_name,
        })
    }

    pub fn uname2user(&self, uname: &str) -> Option<&Vuser> {
        self.name_to_user.get(uname)
    }

    pub fn uid2user(&self, uid: u32) -> Option<&Vuser> {
        self.id_to_name
            .get(&uid)
            .and_then(|name| self.name_to_user.get(name))
    }

    /// Groups share the user namespace: a group is a user with members.
    pub fn gname2group(&self, gname: &str) -> Option<&Vuser> {
        self.uname2user(gname)
    }

    pub fn gid2group(&self, gid: u32) -> Option<&Vuser> {
        self.uid2user(gid)
    }

    /// Whether `uname` belongs to the group `gname`. Every user is a
    /// member of the group bearing their own name.
    pub fn is_member(&self, uname: &str, gname: &str) -> bool {
        if uname == gname {
            return true;
        }
        match self.uname2user(uname) {
            Some(user) => user.groups.iter().any(|g| g == gname),
            None => false,
        }
    }
}

fn records(data: &str) -> impl Iterator<Item = (usize, &str)> {
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

/// Open the user file, creating it with the initial users when absent.
async fn read_users_file(path: &Path) -> std::io::Result<String> {
    if let Some(dir) = path.parent() {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(dir).await?;
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(0o600);

    match opts.open(path).await {
        Ok(mut fp) => {
            fp.write_all(INITIAL_USERS.as_bytes()).await?;
            Ok(INITIAL_USERS.to_owned())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => fs::read_to_string(path).await,
        Err(e) => Err(e),
    }
}
