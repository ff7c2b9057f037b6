//! End-to-end behaviour of the filesystem core over the in-memory engine.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sealfs::crypto::{self, DbKey};
use sealfs::fcntl::{OpenFlags, Whence};
use sealfs::file::{DeviceOps, FileDescriptor};
use sealfs::fs::{InodeManager, InodeParams, InodeType, Options};
use sealfs::{Error, KvEngine, MemEngine};

fn new_manager(blksize: usize, key: &DbKey, engine: &Arc<MemEngine>) -> Arc<InodeManager> {
    let mut options = Options::new(key.clone());
    options.blksize = blksize;
    let mgr = InodeManager::create(options, Arc::clone(engine) as Arc<dyn KvEngine>).unwrap();
    mgr.start().unwrap();
    Arc::new(mgr)
}

fn fixture(blksize: usize) -> Arc<InodeManager> {
    let key = crypto::generate_key(256).unwrap();
    let engine = Arc::new(MemEngine::new());
    new_manager(blksize, &key, &engine)
}

fn mkroot(mgr: &Arc<InodeManager>) -> u64 {
    let ino = mgr.ino_allocate();
    mgr.transact(&[ino], |tran| {
        mgr.dir_create(tran, ino, InodeParams::dir(), None)
    })
    .unwrap();
    ino
}

fn mkfile(mgr: &Arc<InodeManager>, dir: u64, name: &[u8], data: Option<&[u8]>) -> u64 {
    let ino = mgr.ino_allocate();
    mgr.transact(&[dir, ino], |tran| {
        mgr.file_create(tran, ino, InodeParams::file(), data)?;
        mgr.dir_set_entry(tran, dir, name, ino)
    })
    .unwrap();
    ino
}

fn mkdir(mgr: &Arc<InodeManager>, parent: u64, name: &[u8]) -> u64 {
    let ino = mgr.ino_allocate();
    mgr.transact(&[parent, ino], |tran| {
        mgr.dir_create(tran, ino, InodeParams::dir(), Some(parent))?;
        mgr.dir_set_entry(tran, parent, name, ino)
    })
    .unwrap();
    ino
}

const PAYLOAD: &[u8] = b"Test Buffer for File Descriptor";

#[test]
fn write_then_read_with_stat() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", None);

    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDWR).unwrap();
    assert_eq!(fd.write(PAYLOAD, Some(0), OpenFlags::empty()).unwrap(), 31);

    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(stat.size, 31);
    assert_eq!(stat.blocks, 7);
    assert_eq!(stat.blksize, 5);

    let before = stat.atime;
    thread::sleep(Duration::from_millis(5));

    let mut buf = [0u8; 31];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 31);
    assert_eq!(&buf, PAYLOAD);

    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert!(stat.atime > before);
}

#[test]
fn read_subrange() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(PAYLOAD));

    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 27];
    assert_eq!(fd.read(&mut buf, Some(4)).unwrap(), 27);
    assert_eq!(&buf, b" Buffer for File Descriptor");
}

#[test]
fn overwrite_in_place_keeps_size() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(PAYLOAD));

    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDWR).unwrap();
    assert_eq!(fd.write(b"Nice", Some(0), OpenFlags::empty()).unwrap(), 4);

    let mut buf = [0u8; 31];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 31);
    assert_eq!(&buf, b"Nice Buffer for File Descriptor");

    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(stat.size, 31);
}

#[test]
fn append_below_and_across_the_block_boundary() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(PAYLOAD));
    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDWR).unwrap();

    // Fills the one-byte tail block to the boundary and spills.
    assert_eq!(fd.write(b" Tests", None, OpenFlags::APPEND).unwrap(), 6);
    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(stat.size, 37);
    assert_eq!(stat.blocks, 8);

    let mut buf = [0u8; 37];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 37);
    assert_eq!(&buf[..], b"Test Buffer for File Descriptor Tests" as &[u8]);

    // Stays inside the tail block.
    assert_eq!(fd.write(b"sss", None, OpenFlags::APPEND).unwrap(), 3);
    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(stat.size, 40);
    assert_eq!(stat.blocks, 8);

    let mut buf = [0u8; 40];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 40);
    assert_eq!(&buf[..], b"Test Buffer for File Descriptor Testssss" as &[u8]);
}

#[test]
fn append_after_exactly_full_block_starts_a_new_one() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(b"0123456789"));
    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDWR).unwrap();

    assert_eq!(fd.write(b"Z", None, OpenFlags::APPEND).unwrap(), 1);
    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(stat.size, 11);
    assert_eq!(stat.blocks, 3);

    let (last_idx, last) = mgr.file_get_last_block(file).unwrap();
    assert_eq!(last_idx, 2);
    assert_eq!(last, b"Z");

    let mut buf = [0u8; 11];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 11);
    assert_eq!(&buf[..], b"0123456789Z" as &[u8]);
}

#[test]
fn eof_reads_are_short_or_empty() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(b"abcdefg"));
    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDONLY).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(fd.read(&mut buf, Some(5)).unwrap(), 2);
    assert_eq!(&buf[..2], b"fg");
    assert_eq!(fd.read(&mut buf, Some(7)).unwrap(), 0);
    assert_eq!(fd.read(&mut buf, Some(1000)).unwrap(), 0);
}

#[test]
fn positional_io_leaves_the_cursor_and_sequential_io_advances_it() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", None);
    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDWR).unwrap();

    assert_eq!(fd.write(b"abcdef", None, OpenFlags::empty()).unwrap(), 6);
    assert_eq!(fd.pos(), 6);
    assert_eq!(fd.write(b"XY", Some(0), OpenFlags::empty()).unwrap(), 2);
    assert_eq!(fd.pos(), 6);

    assert_eq!(fd.set_pos(0, Whence::Set).unwrap(), 0);
    let mut buf = [0u8; 4];
    assert_eq!(fd.read(&mut buf, None).unwrap(), 4);
    assert_eq!(&buf, b"XYcd");
    assert_eq!(fd.pos(), 4);

    assert_eq!(fd.set_pos(-2, Whence::End).unwrap(), 4);
    assert_eq!(fd.set_pos(1, Whence::Cur).unwrap(), 5);
    assert!(matches!(
        fd.set_pos(-10, Whence::Set),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn sparse_writes_leave_zero_filled_holes() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(b"abc"));
    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDWR).unwrap();

    assert_eq!(fd.write(b"xyz", Some(20), OpenFlags::empty()).unwrap(), 3);
    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(stat.size, 23);
    assert_eq!(stat.blocks, 5);

    let mut buf = [0u8; 23];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 23);
    let mut expected = vec![0u8; 23];
    expected[..3].copy_from_slice(b"abc");
    expected[20..].copy_from_slice(b"xyz");
    assert_eq!(buf.to_vec(), expected);

    // The gap blocks were never written: the stream reports them as holes.
    let hole = mgr
        .file_get_blocks(file, 5, 1, Some(4))
        .unwrap()
        .map(Result::unwrap)
        .collect::<Vec<_>>();
    assert_eq!(hole, vec![vec![0u8; 5]; 3]);
}

#[test]
fn aligned_full_block_write_does_not_touch_neighbours() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", None);
    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDWR).unwrap();

    assert_eq!(fd.write(b"BLOCK", Some(5), OpenFlags::empty()).unwrap(), 5);

    // Block 0 stays a hole; only block 1 gained a record.
    let blocks = mgr
        .file_get_blocks(file, 5, 0, Some(2))
        .unwrap()
        .map(Result::unwrap)
        .collect::<Vec<_>>();
    assert_eq!(blocks[0], vec![0u8; 5]);
    assert_eq!(blocks[1], b"BLOCK");

    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(stat.size, 10);
    assert_eq!(stat.blocks, 2);
}

#[test]
fn truncating_open_clears_blocks() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(PAYLOAD));

    let fd = FileDescriptor::open(
        Arc::clone(&mgr),
        file,
        OpenFlags::RDWR | OpenFlags::TRUNC,
    )
    .unwrap();
    drop(fd);

    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(stat.size, 0);
    assert_eq!(stat.blocks, 0);
    assert_eq!(mgr.file_get_last_block(file).unwrap(), (0, Vec::new()));
}

#[test]
fn truncate_trims_the_tail_block_in_place() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(PAYLOAD));

    mgr.transact(&[file], |tran| mgr.file_truncate(tran, file, 7))
        .unwrap();
    let stat = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(stat.size, 7);
    assert_eq!(stat.blocks, 2);
    assert_eq!(mgr.file_get_last_block(file).unwrap(), (1, b"Bu".to_vec()));

    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 7);
    assert_eq!(&buf[..7], b"Test Bu");
}

#[test]
fn nlink_accounting_follows_the_edge_rules() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let stat = mgr
        .transact(&[root], |tran| mgr.stat_get(tran, root))
        .unwrap();
    // "." plus the root's own back-edge.
    assert_eq!(stat.nlink, 2);

    let sub = mkdir(&mgr, root, b"sub");
    let (root_stat, sub_stat) = mgr
        .transact(&[root, sub], |tran| {
            Ok((mgr.stat_get(tran, root)?, mgr.stat_get(tran, sub)?))
        })
        .unwrap();
    // Root gains the child's "..".
    assert_eq!(root_stat.nlink, 3);
    // Entry in the parent plus its own ".".
    assert_eq!(sub_stat.nlink, 2);

    let file = mkfile(&mgr, root, b"file", None);
    let nlink = mgr
        .transact(&[file], |tran| Ok(mgr.stat_get(tran, file)?.nlink))
        .unwrap();
    assert_eq!(nlink, 1);

    // A hard link adds an edge; removing one name keeps the inode.
    mgr.transact(&[root, file], |tran| {
        mgr.dir_set_entry(tran, root, b"hard", file)
    })
    .unwrap();
    let nlink = mgr
        .transact(&[file], |tran| Ok(mgr.stat_get(tran, file)?.nlink))
        .unwrap();
    assert_eq!(nlink, 2);

    mgr.transact(&[root, file], |tran| {
        mgr.dir_unset_entry(tran, root, b"file")
    })
    .unwrap();
    let info = mgr
        .transact(&[file], |tran| mgr.get(tran, file))
        .unwrap()
        .unwrap();
    assert_eq!(info.typ, InodeType::File);
    assert!(!info.gc);
}

#[test]
fn dir_set_entry_is_idempotent() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", None);

    let before = mgr
        .transact(&[file], |tran| Ok(mgr.stat_get(tran, file)?.nlink))
        .unwrap();
    mgr.transact(&[root, file], |tran| {
        mgr.dir_set_entry(tran, root, b"file", file)
    })
    .unwrap();
    let after = mgr
        .transact(&[file], |tran| Ok(mgr.stat_get(tran, file)?.nlink))
        .unwrap();
    assert_eq!(before, after);

    let entries = mgr
        .transact(&[root], |tran| mgr.dir_entries(tran, root))
        .unwrap();
    let named: Vec<_> = entries
        .iter()
        .filter(|(name, _)| name != b"." && name != b"..")
        .collect();
    assert_eq!(named.len(), 1);
}

#[test]
fn rename_preserves_the_child() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"a", None);

    let before = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    mgr.transact(&[root, file], |tran| {
        mgr.dir_reset_entry(tran, root, b"a", b"b")
    })
    .unwrap();

    let found = mgr
        .transact(&[root], |tran| {
            Ok((
                mgr.dir_get_entry(tran, root, b"a")?,
                mgr.dir_get_entry(tran, root, b"b")?,
            ))
        })
        .unwrap();
    assert_eq!(found, (None, Some(file)));

    let after = mgr
        .transact(&[file], |tran| mgr.stat_get(tran, file))
        .unwrap();
    assert_eq!(after.nlink, before.nlink);
    assert_eq!(after.size, before.size);
    assert_eq!(after.mtime, before.mtime);
}

#[test]
fn rename_displaces_the_previous_occupant() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let keep = mkfile(&mgr, root, b"keep", None);
    let gone = mkfile(&mgr, root, b"gone", None);

    mgr.transact(&[root, keep, gone], |tran| {
        mgr.dir_reset_entry(tran, root, b"keep", b"gone")
    })
    .unwrap();

    assert!(mgr
        .transact(&[gone], |tran| mgr.get(tran, gone))
        .unwrap()
        .is_none());
    assert_eq!(
        mgr.transact(&[root], |tran| mgr.dir_get_entry(tran, root, b"gone"))
            .unwrap(),
        Some(keep)
    );
}

#[test]
fn reserved_names_are_rejected() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", None);

    for name in [b"." as &[u8], b".."] {
        let result = mgr.transact(&[root, file], |tran| {
            mgr.dir_set_entry(tran, root, name, file)
        });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result =
            mgr.transact(&[root], |tran| mgr.dir_unset_entry(tran, root, name));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
    let result = mgr.transact(&[root, file], |tran| {
        mgr.dir_set_entry(tran, root, b"a/b", file)
    });
    assert!(matches!(result, Err(Error::InvalidName(_))));
}

#[test]
fn empty_directory_destroys_but_populated_one_refuses() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let sub = mkdir(&mgr, root, b"sub");
    let _file = mkfile(&mgr, sub, b"file", None);

    let result = mgr.transact(&[root, sub], |tran| {
        mgr.dir_unset_entry(tran, root, b"sub")
    });
    assert!(matches!(result, Err(Error::NotEmpty(ino)) if ino == sub));

    mgr.transact(&[sub], |tran| mgr.dir_unset_entry(tran, sub, b"file"))
        .unwrap();
    mgr.transact(&[root, sub], |tran| {
        mgr.dir_unset_entry(tran, root, b"sub")
    })
    .unwrap();

    assert!(mgr
        .transact(&[sub], |tran| mgr.get(tran, sub))
        .unwrap()
        .is_none());
    // The parent lost the child's back-edge.
    let nlink = mgr
        .transact(&[root], |tran| Ok(mgr.stat_get(tran, root)?.nlink))
        .unwrap();
    assert_eq!(nlink, 2);
}

#[test]
fn gc_defers_destruction_while_descriptors_live() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(PAYLOAD));

    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDWR).unwrap();
    mgr.transact(&[root, file], |tran| {
        mgr.dir_unset_entry(tran, root, b"file")
    })
    .unwrap();

    let info = mgr
        .transact(&[file], |tran| mgr.get(tran, file))
        .unwrap()
        .unwrap();
    assert!(info.gc);

    // The descriptor still works on the parked inode.
    let mut buf = [0u8; 4];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 4);
    assert_eq!(&buf, b"Test");
    assert_eq!(fd.write(b"Last", None, OpenFlags::APPEND).unwrap(), 4);

    fd.close().unwrap();
    assert!(mgr
        .transact(&[file], |tran| mgr.get(tran, file))
        .unwrap()
        .is_none());
    assert_eq!(mgr.file_get_last_block(file).unwrap(), (0, Vec::new()));
}

#[test]
fn gc_scheduled_inodes_die_on_the_next_start() {
    let key = crypto::generate_key(256).unwrap();
    let engine = Arc::new(MemEngine::new());
    let mgr = new_manager(5, &key, &engine);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(PAYLOAD));

    // A live descriptor reference parks the unlinked inode in the gc set;
    // the "process" then dies without ever closing it.
    mgr.ref_inc(file);
    mgr.transact(&[root, file], |tran| {
        mgr.dir_unset_entry(tran, root, b"file")
    })
    .unwrap();
    assert!(mgr
        .transact(&[file], |tran| mgr.get(tran, file))
        .unwrap()
        .unwrap()
        .gc);
    drop(mgr);

    let mgr = new_manager(5, &key, &engine);
    assert!(mgr
        .transact(&[file], |tran| mgr.get(tran, file))
        .unwrap()
        .is_none());
    assert_eq!(mgr.file_get_last_block(file).unwrap(), (0, Vec::new()));

    // The swept index is available again.
    assert_eq!(mgr.ino_allocate(), file);
}

#[test]
fn destroyed_indices_return_to_the_counter() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", None);

    mgr.transact(&[root, file], |tran| {
        mgr.dir_unset_entry(tran, root, b"file")
    })
    .unwrap();
    assert_eq!(mgr.ino_allocate(), file);
}

#[test]
fn failed_creation_returns_the_index() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let ino = mgr.ino_allocate();
    let observer = Arc::clone(&mgr);
    let result: Result<(), Error> = mgr.transact(&[root, ino], |tran| {
        tran.queue_failure(move || observer.ino_deallocate(ino));
        mgr.file_create(tran, ino, InodeParams::file(), None)?;
        Err(Error::NotFound)
    });
    assert!(result.is_err());
    assert!(mgr
        .transact(&[ino], |tran| mgr.get(tran, ino))
        .unwrap()
        .is_none());
    assert_eq!(mgr.ino_allocate(), ino);
}

#[test]
fn only_one_root_may_exist() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let ino = mgr.ino_allocate();
    let result = mgr.transact(&[ino], |tran| {
        mgr.dir_create(tran, ino, InodeParams::dir(), None)
    });
    assert!(matches!(result, Err(Error::DuplicateRoot)));

    // Destroying the root clears the pointer and a new root may rise.
    mgr.transact(&[root], |tran| mgr.destroy(tran, root))
        .unwrap();
    let new_root = mgr.ino_allocate();
    mgr.transact(&[new_root], |tran| {
        mgr.dir_create(tran, new_root, InodeParams::dir(), None)
    })
    .unwrap();
}

#[test]
fn symlinks_store_their_target_verbatim() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let ino = mgr.ino_allocate();
    mgr.transact(&[root, ino], |tran| {
        mgr.symlink_create(tran, ino, InodeParams::symlink(), "../target path")?;
        mgr.dir_set_entry(tran, root, b"link", ino)
    })
    .unwrap();

    let (target, size) = mgr
        .transact(&[ino], |tran| {
            Ok((
                mgr.symlink_get_target(tran, ino)?,
                mgr.stat_get(tran, ino)?.size,
            ))
        })
        .unwrap();
    assert_eq!(target, "../target path");
    assert_eq!(size, 14);
}

#[test]
fn chardev_descriptors_dispatch_to_registered_hooks() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let ino = mgr.ino_allocate();
    mgr.transact(&[root, ino], |tran| {
        mgr.chardev_create(tran, ino, InodeParams::chardev(), 1, 5)?;
        mgr.dir_set_entry(tran, root, b"zero", ino)
    })
    .unwrap();

    let mut fd = FileDescriptor::open(Arc::clone(&mgr), ino, OpenFlags::RDWR).unwrap();
    let mut buf = [0xffu8; 8];
    let unregistered = fd.read(&mut buf, None);
    assert!(matches!(unregistered, Err(Error::TypeMismatch { .. })));

    mgr.devices().register(
        1,
        5,
        DeviceOps {
            read: |_, buf, _| {
                buf.fill(0);
                Ok(buf.len())
            },
            write: |_, buf, _| Ok(buf.len()),
        },
    );
    assert_eq!(fd.read(&mut buf, None).unwrap(), 8);
    assert_eq!(buf, [0u8; 8]);
    assert_eq!(fd.write(b"discard", None, OpenFlags::empty()).unwrap(), 7);
}

#[test]
fn reads_on_directories_are_a_type_mismatch() {
    let mgr = fixture(5);
    let root = mkroot(&mgr);
    let mut fd = FileDescriptor::open(Arc::clone(&mgr), root, OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 4];
    assert!(matches!(
        fd.read(&mut buf, None),
        Err(Error::TypeMismatch { .. })
    ));
}

#[test]
fn lifecycle_misuse_is_rejected() {
    let key = crypto::generate_key(256).unwrap();
    let engine = Arc::new(MemEngine::new());
    let mut options = Options::new(key.clone());
    options.blksize = 5;
    let mgr =
        InodeManager::create(options, Arc::clone(&engine) as Arc<dyn KvEngine>).unwrap();

    assert!(matches!(
        mgr.transact(&[], |_| Ok(())),
        Err(Error::NotRunning)
    ));
    assert!(matches!(mgr.stop(), Err(Error::NotRunning)));

    mgr.start().unwrap();
    assert!(matches!(mgr.start(), Err(Error::Running)));
    assert!(matches!(mgr.destroy_all(), Err(Error::Running)));

    mgr.stop().unwrap();
    mgr.destroy_all().unwrap();
    assert!(matches!(mgr.start(), Err(Error::Destroyed)));
    assert!(engine.is_empty());

    let zero_block = InodeManager::create(
        {
            let mut o = Options::new(key);
            o.blksize = 0;
            o
        },
        Arc::new(MemEngine::new()) as Arc<dyn KvEngine>,
    );
    assert!(matches!(zero_block, Err(Error::InvalidArgument(_))));
}

#[test]
fn counter_survives_restart_from_the_inodes_domain() {
    let key = crypto::generate_key(256).unwrap();
    let engine = Arc::new(MemEngine::new());
    let mgr = new_manager(5, &key, &engine);
    let root = mkroot(&mgr);
    let a = mkfile(&mgr, root, b"a", None);
    let b = mkfile(&mgr, root, b"b", None);
    assert_eq!((root, a, b), (1, 2, 3));

    // Free the middle index, then restart.
    mgr.transact(&[root, a], |tran| mgr.dir_unset_entry(tran, root, b"a"))
        .unwrap();
    mgr.stop().unwrap();

    let mgr = new_manager(5, &key, &engine);
    assert_eq!(mgr.ino_allocate(), a);
    assert_eq!(mgr.ino_allocate(), 4);
}

#[test]
fn wrong_key_surfaces_as_decryption_failure() {
    let engine = Arc::new(MemEngine::new());
    let key = crypto::generate_key(256).unwrap();
    let mgr = new_manager(5, &key, &engine);
    let root = mkroot(&mgr);
    let _file = mkfile(&mgr, root, b"file", Some(PAYLOAD));
    mgr.stop().unwrap();
    drop(mgr);

    let other = crypto::generate_key(256).unwrap();
    let mgr = new_manager(5, &other, &engine);
    // Keys are cleartext so the startup sweep passes; the first value read
    // fails authentication instead.
    let result = mgr.transact(&[root], |tran| mgr.stat_get(tran, root));
    assert!(matches!(result, Err(Error::AeadFailed)));
}

#[test]
fn workers_offload_block_crypto_transparently() {
    let key = crypto::generate_key(256).unwrap();
    let engine = Arc::new(MemEngine::new());
    let mut options = Options::new(key.clone());
    options.blksize = 5;
    options.workers = Some(2);
    let mgr = Arc::new(
        InodeManager::create(options, Arc::clone(&engine) as Arc<dyn KvEngine>).unwrap(),
    );
    mgr.start().unwrap();

    let root = mkroot(&mgr);
    let file = mkfile(&mgr, root, b"file", Some(PAYLOAD));
    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDWR).unwrap();
    let mut buf = [0u8; 31];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 31);
    assert_eq!(&buf, PAYLOAD);

    // The same records must open under an inline-envelope manager.
    mgr.stop().unwrap();
    drop(fd);
    let mgr = new_manager(5, &key, &engine);
    let mut fd = FileDescriptor::open(Arc::clone(&mgr), file, OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 31];
    assert_eq!(fd.read(&mut buf, Some(0)).unwrap(), 31);
    assert_eq!(&buf, PAYLOAD);
}
