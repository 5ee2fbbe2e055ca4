use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

/// Normalize a listen endpoint: a bare `:port` binds every interface.
pub fn listen_addr(arg: &str) -> String {
    if arg.starts_with(':') {
        format!("0.0.0.0{}", arg)
    } else {
        arg.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        assert_eq!(listen_addr(":5001"), "0.0.0.0:5001");
        assert_eq!(listen_addr("127.0.0.1:5001"), "127.0.0.1:5001");
    }
}
