pub mod routes;

#[cfg(test)]
mod tests;
