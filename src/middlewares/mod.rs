pub mod default_headers;
