//! Copying time steps between database files.

use std::path::PathBuf;

use crate::error::{DatabaseError, DbResult, UsageError};
use crate::storage::Container;

use super::writer::step_attrs;
use super::{Database, TimeStep, INPUTS_GROUP};

impl Database {
    /// Copies every time step of `other` strictly before `(upto_cycle,
    /// upto_node)` into this file.
    ///
    /// Steps already present here are replaced. Each step is copied in its
    /// own commit, auxiliary groups included, with `@`-references rewritten
    /// to the copies. Inputs are copied too if this file has none yet.
    /// Returns the number of steps copied.
    ///
    /// # Errors
    /// Returns [`UsageError::ReadOnly`] / [`UsageError::NotOpen`] or the
    /// container error of the failing step; steps committed before it stay.
    pub fn merge_history(
        &mut self,
        other: &Database,
        upto_cycle: u32,
        upto_node: u32,
    ) -> DbResult<usize> {
        let steps: Vec<TimeStep> = other
            .time_steps()?
            .into_iter()
            .filter(|ts| ts.is_before(upto_cycle, upto_node))
            .collect();
        let source = other.container()?;
        let container = self.container_mut()?;

        if !container.exists(INPUTS_GROUP) && source.exists(INPUTS_GROUP) {
            let mut txn = container.begin()?;
            txn.copy_from(source, INPUTS_GROUP, INPUTS_GROUP)?;
            txn.commit()?;
        }

        for ts in &steps {
            let group = ts.group_name();
            let mut txn = container.begin()?;
            if txn.container().exists(&group) {
                txn.remove(&group)?;
            }
            txn.copy_from(source, &group, &group)?;
            txn.commit()?;
            tracing::debug!(time_step = %ts, "merged time step");
        }

        tracing::info!(
            from = %other.path().display(),
            into = %self.path.display(),
            steps = steps.len(),
            upto_cycle,
            upto_node,
            "merged history"
        );
        Ok(steps.len())
    }

    /// Copies time step `src_ts` of `other` into this file as `dst_ts`.
    ///
    /// # Errors
    /// - [`UsageError::TimeStepNotFound`] if `other` does not store `src_ts`
    /// - [`UsageError::ReadOnly`] / [`UsageError::NotOpen`]
    pub fn copy_time_step_from(
        &mut self,
        other: &Database,
        src_ts: &TimeStep,
        dst_ts: &TimeStep,
    ) -> DbResult<()> {
        let source = other.container()?;
        let src = src_ts.group_name();
        if !source.is_group(&src) {
            return Err(UsageError::TimeStepNotFound { group: src }.into());
        }
        let dst = dst_ts.group_name();

        let container = self.container_mut()?;
        let mut txn = container.begin()?;
        if txn.container().exists(&dst) {
            txn.remove(&dst)?;
        }
        txn.copy_from(source, &src, &dst)?;
        txn.set_attrs(&dst, step_attrs(dst_ts))?;
        txn.commit()?;
        tracing::info!(from = %src_ts, to = %dst_ts, "copied time step");
        Ok(())
    }

    /// Writes `steps` into a new file `<stem>-<suffix>.<ext>` next to this
    /// one, together with the run metadata and inputs.
    ///
    /// The new file keeps this file's schema version. Returns its path.
    ///
    /// # Errors
    /// - [`UsageError::InvalidArgument`] for an empty suffix
    /// - [`UsageError::TimeStepNotFound`] if a step is not stored here
    pub fn split_database(&self, steps: &[TimeStep], suffix: &str) -> DbResult<PathBuf> {
        if suffix.is_empty() {
            return Err(DatabaseError::invalid_argument("split suffix must not be empty"));
        }
        let source = self.container()?;
        for ts in steps {
            if !source.is_group(&ts.group_name()) {
                return Err(UsageError::TimeStepNotFound {
                    group: ts.group_name(),
                }
                .into());
            }
        }

        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| {
                DatabaseError::invalid_argument(format!(
                    "database path {} has no file name",
                    self.path.display()
                ))
            })?;
        let mut name = format!("{stem}-{suffix}");
        if let Some(ext) = self.path.extension() {
            name.push('.');
            name.push_str(&ext.to_string_lossy());
        }
        let target = self.path.with_file_name(name);

        let mut split = Container::create(&target, self.config.sync_on_write)?;
        let mut txn = split.begin()?;
        txn.set_attrs("", source.attrs("").cloned().unwrap_or_default())?;
        if source.exists(INPUTS_GROUP) {
            txn.copy_from(source, INPUTS_GROUP, INPUTS_GROUP)?;
        }
        for ts in steps {
            let group = ts.group_name();
            txn.copy_from(source, &group, &group)?;
        }
        txn.commit()?;
        split.close()?;

        tracing::info!(
            from = %self.path.display(),
            to = %target.display(),
            steps = steps.len(),
            "split database"
        );
        Ok(target)
    }
}
