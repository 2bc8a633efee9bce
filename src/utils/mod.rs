pub(crate) mod slab;

pub(crate) use self::slab::Slab;
