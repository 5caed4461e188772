//! Uninitialized pages.
//!
//! Pages are created lazily: allocating a page only records how its initial
//! contents are produced. The contents are produced into a frame on the first
//! fault, at which point the page becomes anonymous or file-backed.
//!
//! The recipe for the initial contents is a [`Loader`]:
//! - [`Loader::FromFile`] reads `read_bytes` bytes of a file starting at
//!   `offset` and zero-fills the rest of the page. It serves program segments
//!   (which become anonymous pages) and memory-mapped files (which stay
//!   attached to the file).
//! - [`Loader::Zeroed`] produces a zero-filled page, for the heap and the
//!   stack.

use crate::{
    anon::AnonPage,
    file::FilePage,
    frame::Frame,
    page::{AddressSpace, PageState, VmType},
};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::File,
};

/// Describes how to produce the initial contents of a page.
pub enum Loader {
    /// Read `read_bytes` bytes of `file` at `offset`, zero-fill the rest.
    FromFile {
        /// An independent handle on the file.
        file: File,
        /// Offset in the file where the page contents start.
        offset: usize,
        /// Bytes of the page that come from the file.
        read_bytes: usize,
    },
    /// A zero-filled page.
    Zeroed,
}

impl Loader {
    /// Deep copy of the loader. The file handle, if any, is duplicated.
    pub fn duplicate(&self) -> Self {
        match self {
            Loader::FromFile {
                file,
                offset,
                read_bytes,
            } => Loader::FromFile {
                file: file.duplicate(),
                offset: *offset,
                read_bytes: *read_bytes,
            },
            Loader::Zeroed => Loader::Zeroed,
        }
    }

    /// Produces the contents into `frame`.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if `read_bytes` exceeds a page.
    /// - `Err(KernelError::IOError)` if the file yields fewer bytes than
    ///   requested.
    pub fn load(&mut self, frame: &mut Frame) -> Result<(), KernelError> {
        let buf = frame.inner_mut();
        match self {
            Loader::FromFile {
                file,
                offset,
                read_bytes,
            } => {
                let read_bytes = *read_bytes;
                if read_bytes > PAGE_SIZE {
                    return Err(KernelError::InvalidArgument);
                }
                file.seek(*offset);
                if file.read(&mut buf[..read_bytes])? != read_bytes {
                    return Err(KernelError::IOError);
                }
                buf[read_bytes..].fill(0);
                Ok(())
            }
            Loader::Zeroed => {
                buf.fill(0);
                Ok(())
            }
        }
    }
}

/// State of a page that has never been brought into memory.
pub struct Uninit {
    loader: Loader,
    target: VmType,
}

impl Uninit {
    /// Creates the state of a page that becomes `target` once loaded.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if `target` is not a concrete
    ///   type, is [`VmType::File`] without a file to load from, or would read
    ///   more than a page from the file.
    pub fn new(loader: Loader, target: VmType) -> Result<Self, KernelError> {
        match (target, &loader) {
            (_, Loader::FromFile { read_bytes, .. }) if *read_bytes > PAGE_SIZE => {
                Err(KernelError::InvalidArgument)
            }
            (VmType::Anon, _) | (VmType::File, Loader::FromFile { .. }) => {
                Ok(Self { loader, target })
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// The type the page becomes once loaded.
    pub fn target(&self) -> VmType {
        self.target
    }

    /// The loader of the page.
    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Deep copy of the state.
    pub fn duplicate(&self) -> Self {
        Self {
            loader: self.loader.duplicate(),
            target: self.target,
        }
    }

    /// Loads the page into `frame` and turns it into its target type.
    ///
    /// If loading fails, the page stays uninitialized and the error is
    /// returned along with it.
    pub(crate) fn initialize(
        self,
        va: Va,
        space: &AddressSpace,
        frame: &mut Frame,
    ) -> (PageState, Result<(), KernelError>) {
        let Self { mut loader, target } = self;
        if let Err(e) = loader.load(frame) {
            return (PageState::Uninit(Self { loader, target }), Err(e));
        }
        let state = match (target, loader) {
            (
                VmType::File,
                Loader::FromFile {
                    file,
                    offset,
                    read_bytes,
                },
            ) => {
                // Filling the frame must not count as a user modification.
                space.page_table.set_dirty(va, false);
                PageState::File(FilePage::new(file, offset, read_bytes))
            }
            _ => PageState::Anon(AnonPage::new(space.pid)),
        };
        (state, Ok(()))
    }
}
