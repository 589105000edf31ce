#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    AlreadyExists,
    NotFound,
    NotADirectory,
    DirectoryNotEmpty,
    DirectoryInUse,
    NameTooLong,
    BadPath,
    NoSpace,
}
