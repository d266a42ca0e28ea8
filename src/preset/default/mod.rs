pub(crate) use c::C_PRESET;
pub(crate) use cpp::CPP_PRESET;

mod c;
mod cpp;
