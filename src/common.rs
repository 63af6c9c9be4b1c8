pub use anyhow::{bail, ensure, format_err, Context, Result};
pub use chrono::Local;
pub use futures::FutureExt;
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fs, iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};
pub use structopt::StructOpt;
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, ModuleT, OptimizerConfig},
    Device, Kind, Reduction, Tensor,
};
pub use tracing::{debug, info, info_span, warn};

pub type Fallible<T> = Result<T>;
