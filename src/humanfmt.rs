#[must_use]
pub(crate) enum HumanFmt {
    Size(u64),
    Time(std::time::Duration),
}

impl std::fmt::Display for HumanFmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[inline]
        #[must_use]
        const fn precision(size: f64) -> usize {
            if size > 100.0 {
                0
            } else if size > 10.0 {
                1
            } else {
                2
            }
        }

        #[expect(clippy::cast_precision_loss)]
        match *self {
            Self::Size(bytes) => {
                if bytes < 1000 {
                    return f.write_fmt(format_args!("{bytes}B"));
                }
                let size = bytes as f64 / 1000.0;
                if size < 1000.0 {
                    return f.write_fmt(format_args!("{size:.0$}kB", precision(size)));
                }
                let size = size / 1000.0;
                if size < 1000.0 {
                    return f.write_fmt(format_args!("{size:.0$}MB", precision(size)));
                }
                let size = size / 1000.0;
                if size < 1000.0 {
                    return f.write_fmt(format_args!("{size:.0$}GB", precision(size)));
                }
                let size = size / 1000.0;
                f.write_fmt(format_args!("{size:.0$}TB", precision(size)))
            }
            Self::Time(time) => {
                let time = time.as_nanos();
                if time < 1000 {
                    return f.write_fmt(format_args!("{time}ns"));
                }
                let time = time as f64 / 1000.0;
                if time < 1000.0 {
                    return f.write_fmt(format_args!("{time:.0$}us", precision(time)));
                }
                let time = time / 1000.0;
                if time < 1000.0 {
                    return f.write_fmt(format_args!("{time:.0$}ms", precision(time)));
                }
                let time = time / 1000.0;
                if time < 600.0 {
                    return f.write_fmt(format_args!("{time:.0$}s", precision(time)));
                }
                #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let time = time as u64;
                let secs = time % 60;
                let time = time / 60;
                let mins = time % 60;
                let time = time / 60;
                let hours = time % 24;
                let days = time / 24;

                if days != 0 {
                    f.write_fmt(format_args!("{days}d"))?;
                }
                if hours != 0 {
                    f.write_fmt(format_args!("{hours}h"))?;
                }
                if mins != 0 {
                    f.write_fmt(format_args!("{mins}m"))?;
                }
                if secs != 0 {
                    f.write_fmt(format_args!("{secs}s"))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::humanfmt::HumanFmt;

    #[test]
    fn size_test() {
        assert_eq!(format!("{}", HumanFmt::Size(0)), "0B");
        assert_eq!(format!("{}", HumanFmt::Size(999)), "999B");
        assert_eq!(format!("{}", HumanFmt::Size(1024)), "1.02kB");
        assert_eq!(format!("{}", HumanFmt::Size(1_048_576)), "1.05MB");
        assert_eq!(format!("{}", HumanFmt::Size(247_569_325_892)), "248GB");
        assert_eq!(format!("{}", HumanFmt::Size(u64::MAX)), "18446744TB");
    }

    #[test]
    fn time_test() {
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_nanos(0))),
            "0ns"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_nanos(1024))),
            "1.02us"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_millis(250))),
            "250ms"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_secs(601))),
            "10m1s"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_secs(86401))),
            "1d1s"
        );
    }
}
