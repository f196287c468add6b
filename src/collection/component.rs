//! # Component Files
//!
//! Each part of a collection (data pages, position map, free-space map) owns
//! exactly one file named `<collection>.<extension>`. `ComponentFile` keeps
//! that name and the `FileId` of the open file, and routes lifecycle calls
//! through the atomic operation so they commit or roll back with it.

use eyre::{eyre, Result};

use crate::storage::{AtomicOperation, FileId, FileManager};

#[derive(Debug, Clone)]
pub(crate) struct ComponentFile {
    base_name: String,
    extension: &'static str,
    file_id: Option<FileId>,
}

impl ComponentFile {
    pub fn new(base_name: &str, extension: &'static str) -> Self {
        Self {
            base_name: base_name.to_string(),
            extension,
            file_id: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.base_name, self.extension)
    }

    fn name_for(&self, base_name: &str) -> String {
        format!("{}.{}", base_name, self.extension)
    }

    pub fn id(&self) -> Result<FileId> {
        self.file_id
            .ok_or_else(|| eyre!("file '{}' is not open", self.full_name()))
    }

    pub fn is_open(&self) -> bool {
        self.file_id.is_some()
    }

    pub fn exists(&self, op: &AtomicOperation) -> bool {
        op.file_exists(&self.full_name())
    }

    pub fn create(&mut self, op: &mut AtomicOperation) -> Result<FileId> {
        let id = op.add_file(&self.full_name())?;
        self.file_id = Some(id);
        Ok(id)
    }

    pub fn open(&mut self, op: &AtomicOperation) -> Result<FileId> {
        let id = op.open_file(&self.full_name())?;
        self.file_id = Some(id);
        Ok(id)
    }

    pub fn delete(&mut self, op: &mut AtomicOperation) -> Result<()> {
        op.delete_file(self.id()?)?;
        self.file_id = None;
        Ok(())
    }

    /// Renames the backing file; the new name takes effect on commit.
    pub fn rename(&mut self, op: &mut AtomicOperation, new_base_name: &str) -> Result<()> {
        if let Some(id) = self.file_id {
            op.rename_file(id, &self.name_for(new_base_name))?;
        }
        self.base_name = new_base_name.to_string();
        Ok(())
    }

    pub fn flush(&self, files: &FileManager) -> Result<()> {
        match self.file_id {
            Some(id) => files.flush(id),
            None => Ok(()),
        }
    }

    pub fn close(&mut self, files: &FileManager, flush: bool) -> Result<()> {
        if let Some(id) = self.file_id.take() {
            files.close_file(id, flush)?;
        }
        Ok(())
    }
}
