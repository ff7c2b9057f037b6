use bitflags::bitflags;

bitflags! {
    /// Open flags carried by a file descriptor.
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
    }
}

impl OpenFlags {
    const ACCMODE: u32 = 0o3;

    pub fn readable(self) -> bool {
        self.bits() & Self::ACCMODE != Self::WRONLY.bits()
    }

    pub fn writable(self) -> bool {
        self.bits() & Self::ACCMODE != Self::RDONLY.bits()
    }
}

/// Origin of a seek, mirroring lseek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}
