//! Live menu walk
//!
//! The catalog knows the full static tree; the device decides which parts of
//! it exist (installed options, firmware). The walk probes each entry and
//! prunes what the device reports as absent.

use futures::stream::{self, Stream};
use std::sync::Arc;
use tracing::{debug, trace};
use xcom_protocol::{Datapoint, DeviceInstance, Result, XcomError};

use crate::link::{RequestOptions, XcomLink};

/// Lazy, restartable depth-first walk below one menu root
#[derive(Debug)]
pub struct MenuWalk {
    link: XcomLink,
    root: u16,
    /// Catalog family of the entries
    family: String,
    /// Device answering the probes
    instance: DeviceInstance,
    opts: RequestOptions,
    /// Entries still to visit, next one on top
    stack: Vec<Arc<Datapoint>>,
    started: bool,
    done: bool,
}

impl MenuWalk {
    pub(crate) fn new(link: XcomLink, root: u16, family: String, instance: DeviceInstance) -> Self {
        Self {
            link,
            root,
            family,
            instance,
            opts: RequestOptions::default(),
            stack: Vec::new(),
            started: false,
            done: false,
        }
    }

    /// Timeout and retries used for every probe
    pub fn with_options(mut self, opts: RequestOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn root(&self) -> u16 {
        self.root
    }

    pub fn instance(&self) -> &DeviceInstance {
        &self.instance
    }

    /// Forget progress; the next pull probes the device again from the root
    pub fn restart(&mut self) {
        self.stack.clear();
        self.started = false;
        self.done = false;
    }

    fn push_children(&mut self, parent: u16) {
        let children = self
            .link
            .catalog()
            .menu_items(parent, Some(&self.family));
        self.stack.extend(children.into_iter().rev());
    }

    /// Next entry present on the device
    ///
    /// `None` once the tree is exhausted or after an error was yielded.
    pub async fn next(&mut self) -> Option<Result<Arc<Datapoint>>> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            self.push_children(self.root);
        }

        while let Some(dp) = self.stack.pop() {
            match self.link.probe(&dp, &self.instance, self.opts).await {
                Ok(()) => {
                    trace!("Menu {} present on {}", dp.nr, self.instance);
                    if dp.is_menu() {
                        self.push_children(dp.nr);
                    }
                    return Some(Ok(dp));
                },
                Err(XcomError::Device(code)) if code.is_absent() => {
                    debug!("Menu {} absent on {}: {}", dp.nr, self.instance, code);
                },
                Err(e) => {
                    self.done = true;
                    self.stack.clear();
                    return Some(Err(e));
                },
            }
        }

        self.done = true;
        None
    }

    /// Pull the remaining entries, stopping at the first error
    pub async fn collect_all(&mut self) -> Result<Vec<Arc<Datapoint>>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await {
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// Adapt into a `futures` stream
    pub fn into_stream(self) -> impl Stream<Item = Result<Arc<Datapoint>>> {
        stream::unfold(self, |mut walk| async move {
            let item = walk.next().await?;
            Some((item, walk))
        })
    }
}
