/// Default plaintext block size in bytes.
pub const BLKSIZE: usize = 4096;

/// Default permission mask applied on inode creation.
pub const UMASK: u32 = 0o022;

/// Envelope initialization vector length.
pub const IV_SIZE: usize = 16;

/// Envelope authentication tag length.
pub const TAG_SIZE: usize = 16;

/// Bytes of envelope framing in front of every ciphertext.
pub const ENVELOPE_OVERHEAD: usize = IV_SIZE + TAG_SIZE;

/// PBKDF2-HMAC-SHA-512 iteration count. Part of the on-disk contract.
pub const PBKDF2_ROUNDS: u32 = 2048;

/// PBKDF2 salt length in bytes. Part of the on-disk contract.
pub const SALT_SIZE: usize = 16;

/// Separator byte between key-space prefixes. Never appears in a prefix name.
pub const SEP: u8 = b'!';

/// Well-known key of the filesystem root pointer in the manager domain.
pub const ROOT_KEY: &[u8] = b"root";
