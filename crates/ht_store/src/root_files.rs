//! Per-access-group file lists on the root anchor.
//!
//! The root metadata range cannot describe itself in the metadata table,
//! so its cell-store file lists are kept as `files.<access_group>`
//! attributes on `/hypertable/root` instead. Range servers replay them
//! when reloading the root range.

use std::sync::Arc;

use ht_core::{Exception, Result};
use ht_namespace::session::Session;
use ht_namespace::OPEN_FLAG_READ;

use crate::schema::Schema;
use crate::types::ROOT_FILE;

pub struct RootFiles {
    session: Arc<Session>,
    handle: u64,
    ag_names: Vec<String>,
    next: usize,
}

impl RootFiles {
    /// Open the root anchor; `schema` names the access groups to track.
    pub fn open(session: Arc<Session>, schema: &Schema) -> Result<RootFiles> {
        let ag_names = schema.access_group_names().map(str::to_string).collect();
        let root = session.open(ROOT_FILE, OPEN_FLAG_READ, None)?;
        Ok(RootFiles {
            session,
            handle: root.handle,
            ag_names,
            next: 0,
        })
    }

    pub fn reset_scan(&mut self) {
        self.next = 0;
    }

    /// Next `(access_group, files)` pair, or `None` once the groups are
    /// exhausted or an attribute cannot be read.
    pub fn next_files(&mut self) -> Option<(String, String)> {
        let ag_name = self.ag_names.get(self.next)?.clone();
        self.next += 1;
        let attr = format!("files.{ag_name}");
        match self.session.attr_get(self.handle, &attr) {
            Ok(value) => {
                let files = String::from_utf8_lossy(&value).into_owned();
                Some((ag_name, files))
            }
            Err(error) => {
                tracing::error!(
                    attr,
                    error = %error,
                    "problem getting attribute on the root file"
                );
                None
            }
        }
    }

    pub fn write_files(&self, ag_name: &str, files: &str) -> Result<()> {
        let attr = format!("files.{ag_name}");
        self.session
            .attr_set(self.handle, &attr, files.as_bytes())
            .map_err(|e| {
                Exception::chain(
                    e.code(),
                    format!("problem creating attribute '{attr}' on the root file"),
                    e,
                )
            })
    }

    pub fn close(self) -> Result<()> {
        self.session.close(self.handle)
    }
}
