mod parse;

pub(crate) use self::parse::{Opts, parse_opts};
