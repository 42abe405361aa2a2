//! # strand-memfs
//!
//! An in-memory file store. Files are chains of fixed 512-byte blocks; data
//! is addressed through integer descriptors, each with its own cursor.
//! Deleting a file that still has open descriptors orphans it: the name
//! becomes invisible to lookups immediately, the data stays reachable
//! through the existing descriptors, and the memory is released when the
//! last of them closes.
//!
//! Single-threaded by design; every operation goes through `&mut MemFs`.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tracing::debug;

/// Size of one file block.
pub const BLOCK_SIZE: usize = 512;
/// Per-file size cap.
pub const MAX_FILE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Unknown name without `create`, or a stale/invalid descriptor.
    #[error("no such file")]
    NoFile,

    /// The descriptor's open mode forbids the operation.
    #[error("operation not permitted by the open mode")]
    NoPermission,

    /// The operation would push the file past `MAX_FILE_SIZE`.
    #[error("file size limit exceeded")]
    NoMem,
}

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

/// Flags for [`MemFs::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Allocate the file if the name does not resolve.
    pub create: bool,
    pub mode: OpenMode,
}

impl OpenFlags {
    pub fn create() -> Self {
        Self {
            create: true,
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }
}

/// A descriptor handle: an index into the descriptor table. Stale handles
/// (used after `close`) fail with `NoFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(usize);

type Block = Box<[u8; BLOCK_SIZE]>;

fn empty_block() -> Block {
    Box::new([0u8; BLOCK_SIZE])
}

struct File {
    name: String,
    blocks: Vec<Block>,
    /// Open descriptors on this file.
    refs: usize,
    eof_offset: usize,
    /// Name is no longer resolvable; free the file when `refs` drops to 0.
    pending_delete: bool,
}

impl File {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            blocks: Vec::new(),
            refs: 0,
            eof_offset: 0,
            pending_delete: false,
        }
    }
}

struct Descriptor {
    file: Rc<RefCell<File>>,
    mode: OpenMode,
    block_cursor: usize,
    byte_offset: usize,
}

impl Descriptor {
    /// Absolute byte position. `byte_offset` may transiently equal
    /// `BLOCK_SIZE` when a previous operation stopped exactly on a boundary.
    fn cursor(&self) -> usize {
        self.block_cursor * BLOCK_SIZE + self.byte_offset
    }

    /// Normalize a boundary cursor before copying.
    fn step_into_next_block(&mut self) {
        debug_assert_eq!(self.byte_offset, BLOCK_SIZE);
        self.block_cursor += 1;
        self.byte_offset = 0;
    }
}

/// The file store: a name-resolvable file list plus a sparse descriptor
/// table whose vacant slots are reused lowest-first.
#[derive(Default)]
pub struct MemFs {
    files: Vec<Rc<RefCell<File>>>,
    descriptors: Vec<Option<Descriptor>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `name` among live (not pending-delete) files; allocate when
    /// `create` is set. Returns the lowest free descriptor slot.
    pub fn open(&mut self, name: &str, flags: OpenFlags) -> Result<Fd> {
        let existing = self
            .files
            .iter()
            .find(|file| {
                let file = file.borrow();
                file.name == name && !file.pending_delete
            })
            .cloned();

        let file = match existing {
            Some(file) => file,
            None if flags.create => {
                let file = Rc::new(RefCell::new(File::new(name)));
                self.files.push(Rc::clone(&file));
                debug!(name, "file created");
                file
            }
            None => return Err(FsError::NoFile),
        };

        file.borrow_mut().refs += 1;
        let descriptor = Descriptor {
            file,
            mode: flags.mode,
            block_cursor: 0,
            byte_offset: 0,
        };

        let slot = self.descriptors.iter().position(Option::is_none);
        let index = match slot {
            Some(index) => {
                self.descriptors[index] = Some(descriptor);
                index
            }
            None => {
                self.descriptors.push(Some(descriptor));
                self.descriptors.len() - 1
            }
        };
        Ok(Fd(index))
    }

    /// Copy `buf` at the descriptor's cursor, appending blocks across
    /// boundaries, and extend the file's EOF if the cursor moved past it.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let descriptor = self
            .descriptors
            .get_mut(fd.0)
            .and_then(Option::as_mut)
            .ok_or(FsError::NoFile)?;
        if descriptor.mode == OpenMode::ReadOnly {
            return Err(FsError::NoPermission);
        }
        if descriptor.cursor() + buf.len() > MAX_FILE_SIZE {
            return Err(FsError::NoMem);
        }

        let file = Rc::clone(&descriptor.file);
        let mut file = file.borrow_mut();
        if file.blocks.is_empty() {
            file.blocks.push(empty_block());
        }

        let mut written = 0;
        while written < buf.len() {
            if descriptor.byte_offset == BLOCK_SIZE {
                descriptor.step_into_next_block();
                if descriptor.block_cursor == file.blocks.len() {
                    file.blocks.push(empty_block());
                }
            }
            let room = BLOCK_SIZE - descriptor.byte_offset;
            let chunk = room.min(buf.len() - written);
            let offset = descriptor.byte_offset;
            file.blocks[descriptor.block_cursor][offset..offset + chunk]
                .copy_from_slice(&buf[written..written + chunk]);
            written += chunk;
            descriptor.byte_offset += chunk;
        }

        file.eof_offset = file.eof_offset.max(descriptor.cursor());
        Ok(written)
    }

    /// Copy from the cursor up to EOF into `buf`; advances the cursor
    /// without extending the file. Returns 0 at or past EOF.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let descriptor = self
            .descriptors
            .get_mut(fd.0)
            .and_then(Option::as_mut)
            .ok_or(FsError::NoFile)?;
        if descriptor.mode == OpenMode::WriteOnly {
            return Err(FsError::NoPermission);
        }

        let file = Rc::clone(&descriptor.file);
        let file = file.borrow();
        if descriptor.cursor() >= file.eof_offset {
            return Ok(0);
        }
        let want = buf.len().min(file.eof_offset - descriptor.cursor());

        let mut read = 0;
        while read < want {
            if descriptor.byte_offset == BLOCK_SIZE {
                descriptor.step_into_next_block();
            }
            let avail = BLOCK_SIZE - descriptor.byte_offset;
            let chunk = avail.min(want - read);
            let offset = descriptor.byte_offset;
            buf[read..read + chunk]
                .copy_from_slice(&file.blocks[descriptor.block_cursor][offset..offset + chunk]);
            read += chunk;
            descriptor.byte_offset += chunk;
        }
        Ok(read)
    }

    /// Drop the descriptor. Frees the file when it was pending delete and
    /// this was its last open descriptor.
    pub fn close(&mut self, fd: Fd) -> Result<()> {
        let descriptor = self
            .descriptors
            .get_mut(fd.0)
            .and_then(Option::take)
            .ok_or(FsError::NoFile)?;

        let unlink = {
            let mut file = descriptor.file.borrow_mut();
            file.refs -= 1;
            file.refs == 0 && file.pending_delete
        };
        if unlink {
            debug!("orphaned file released on last close");
            self.unlink(&descriptor.file);
        }
        Ok(())
    }

    /// Make `name` unresolvable. Data survives while descriptors remain
    /// open; a later `open(name, create)` allocates a fresh file.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let file = self
            .files
            .iter()
            .find(|file| {
                let file = file.borrow();
                file.name == name && !file.pending_delete
            })
            .cloned()
            .ok_or(FsError::NoFile)?;

        let free_now = {
            let mut file = file.borrow_mut();
            file.pending_delete = true;
            file.refs == 0
        };
        debug!(name, orphaned = !free_now, "file deleted");
        if free_now {
            self.unlink(&file);
        }
        Ok(())
    }

    /// Grow with zero-filled blocks (EOF unchanged) or shrink to
    /// `new_size`, clamping every cursor of the same file that sits past it.
    pub fn resize(&mut self, fd: Fd, new_size: usize) -> Result<()> {
        let descriptor = self
            .descriptors
            .get(fd.0)
            .and_then(Option::as_ref)
            .ok_or(FsError::NoFile)?;
        if descriptor.mode == OpenMode::ReadOnly {
            return Err(FsError::NoPermission);
        }
        if new_size > MAX_FILE_SIZE {
            return Err(FsError::NoMem);
        }

        let file_rc = Rc::clone(&descriptor.file);
        let mut file = file_rc.borrow_mut();
        let new_blocks = new_size.div_ceil(BLOCK_SIZE);

        if file.eof_offset <= new_size {
            while file.blocks.len() < new_blocks {
                file.blocks.push(empty_block());
            }
            return Ok(());
        }

        file.blocks.truncate(new_blocks);
        file.eof_offset = new_size;
        drop(file);

        for slot in self.descriptors.iter_mut().flatten() {
            if Rc::ptr_eq(&slot.file, &file_rc) && slot.cursor() > new_size {
                if new_blocks == 0 {
                    slot.block_cursor = 0;
                    slot.byte_offset = 0;
                } else {
                    slot.block_cursor = new_blocks - 1;
                    slot.byte_offset = new_size - (new_blocks - 1) * BLOCK_SIZE;
                }
            }
        }
        Ok(())
    }

    /// Free every file and reset the descriptor table, including its
    /// reserve.
    pub fn destroy(&mut self) {
        self.files = Vec::new();
        self.descriptors = Vec::new();
    }

    fn unlink(&mut self, file: &Rc<RefCell<File>>) {
        self.files.retain(|candidate| !Rc::ptr_eq(candidate, file));
    }
}
