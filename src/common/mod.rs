// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

mod errors;

pub use self::errors::Error;
pub use self::errors::KeyExistsError;
pub use self::errors::Result;
pub use self::errors::WriteConflictError;
