mod join;
mod split;
